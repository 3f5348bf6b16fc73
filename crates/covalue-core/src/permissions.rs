//! Seams to the permission and account collaborators.

use crate::crypto::{KeyId, KeySecret, SignerId};
use crate::error::ResolveAccountAgentError;
use crate::header::{CoValueHeader, Ruleset};
use crate::ids::{Author, CoValueId};
use crate::pipeline::{Validity, VerifiedTransaction};
use crate::registry::CoValueRegistry;
use crate::verified_state::VerifiedState;

/// What an evaluator may look at while judging one CoValue.
pub struct ValidationContext<'a> {
    pub id: &'a CoValueId,
    pub header: &'a CoValueHeader,
    /// Every other CoValue the node holds (the one being judged is detached).
    pub registry: &'a CoValueRegistry,
}

/// Decides which transactions are authorized.
///
/// Called on every incremental pipeline pass with the complete record list
/// of the CoValue, in session order; only records still
/// [`Validity::Pending`] need a decision. Records left pending are offered
/// again on the next pass.
pub trait PermissionEvaluator: Send {
    fn determine_validity(&self, ctx: &ValidationContext<'_>, records: &mut [VerifiedTransaction]);

    /// Read key for private transactions, if this node holds it.
    fn read_key(&self, ctx: &ValidationContext<'_>, key_id: &KeyId) -> Option<KeySecret> {
        let _ = (ctx, key_id);
        None
    }
}

/// Accepts every correctly signed transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionEvaluator for AllowAll {
    fn determine_validity(&self, _ctx: &ValidationContext<'_>, records: &mut [VerifiedTransaction]) {
        for record in records.iter_mut().filter(|r| r.validity.is_pending()) {
            record.validity = Validity::Valid;
        }
    }
}

/// Maps an account to the signer of its sessions.
pub trait AccountResolver: Send {
    /// `account` is `None` while the account CoValue is not available.
    fn signer_for(
        &self,
        account_id: &CoValueId,
        account: Option<&VerifiedState>,
    ) -> Result<SignerId, ResolveAccountAgentError>;
}

/// An account's signer is the agent named as initial admin in its header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAccountResolver;

impl AccountResolver for HeaderAccountResolver {
    fn signer_for(
        &self,
        account_id: &CoValueId,
        account: Option<&VerifiedState>,
    ) -> Result<SignerId, ResolveAccountAgentError> {
        let account = account.ok_or(ResolveAccountAgentError::AccountNotLoaded(*account_id))?;
        match &account.header().ruleset {
            Ruleset::Group {
                initial_admin: Author::Agent(signer),
            } => Ok(*signer),
            _ => Err(ResolveAccountAgentError::NoSigner(*account_id)),
        }
    }
}
