//! Permission evaluation by group roles.
//!
//! - `unsafe_allow_all`: every transaction is valid.
//! - `group { initial_admin }`: a transaction is valid iff its author is an
//!   admin at its `madeAt`. Transactions are judged in time order, so an
//!   admin's grants take effect for later transactions of the same group.
//! - `owned_by_group { group }`: valid iff the author is admin or writer of
//!   the group at `madeAt`. While the group is not available every pending
//!   transaction is marked invalid; the group's arrival resets validation.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use covalue_core::{
    Author, CoValueId, CoValueType, KeyId, KeySecret, PermissionEvaluator, Ruleset,
    ValidationContext, Validity, VerifiedTransaction,
};

use crate::crypto::X25519StaticSecret;
use crate::keyring::{KeyRing, SealedKey};
use crate::roles::RoleTimeline;

/// Evaluates validity from group roles and serves read keys.
///
/// Read keys come from the shared [`KeyRing`] first; otherwise a sealed key
/// addressed to this node's X25519 key is looked up in the owning group and
/// added to the ring once opened.
#[derive(Debug, Clone)]
pub struct GroupRulesEvaluator {
    keyring: Arc<RwLock<KeyRing>>,
    sealer: Option<X25519StaticSecret>,
}

impl Default for GroupRulesEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(RwLock::new(KeyRing::new())))
    }
}

impl GroupRulesEvaluator {
    pub fn new(keyring: Arc<RwLock<KeyRing>>) -> Self {
        Self {
            keyring,
            sealer: None,
        }
    }

    /// Open sealed keys addressed to `sealer`.
    pub fn with_sealer(mut self, sealer: X25519StaticSecret) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn keyring(&self) -> &Arc<RwLock<KeyRing>> {
        &self.keyring
    }

    fn judge_group(initial_admin: &Author, records: &mut [VerifiedTransaction]) {
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by(|&a, &b| {
            let (ra, rb) = (&records[a], &records[b]);
            (ra.made_at(), &ra.id).cmp(&(rb.made_at(), &rb.id))
        });

        let mut timeline = RoleTimeline::new(initial_admin);
        for idx in order {
            let record = &mut records[idx];
            if record.validity.is_pending() {
                record.validity = if timeline.is_admin_at(record.author(), record.made_at()) {
                    Validity::Valid
                } else {
                    Validity::Invalid("author is not a group admin".into())
                };
            }
            if record.validity.is_valid() {
                timeline.apply_transaction(record);
            }
        }
    }

    fn judge_owned(ctx: &ValidationContext<'_>, group: &CoValueId, records: &mut [VerifiedTransaction]) {
        let Some(core) = ctx.registry.get(group).filter(|c| c.is_available()) else {
            trace!(id = %ctx.id, group = %group, "owning group not available");
            for record in records.iter_mut().filter(|r| r.validity.is_pending()) {
                record.validity = Validity::Invalid("owning group not available".into());
            }
            return;
        };
        let Some(initial_admin) = core.verified().and_then(|v| group_founder(&v.header().ruleset))
        else {
            for record in records.iter_mut().filter(|r| r.validity.is_pending()) {
                record.validity = Validity::Invalid("owner is not a group".into());
            }
            return;
        };

        let timeline = RoleTimeline::from_valid(initial_admin, core.ordered_valid_transactions());
        for record in records.iter_mut().filter(|r| r.validity.is_pending()) {
            record.validity = if timeline.can_write_at(record.author(), record.made_at()) {
                Validity::Valid
            } else {
                Validity::Invalid("author may not write to this group".into())
            };
        }
    }

    fn sealed_key(&self, ctx: &ValidationContext<'_>, key_id: &KeyId) -> Option<KeySecret> {
        let sealer = self.sealer.as_ref()?;
        let group = match &ctx.header.ruleset {
            Ruleset::OwnedByGroup { group } => group,
            _ => return None,
        };
        let content = ctx.registry.get(group)?.content()?;
        let entry = SealedKey::entry_name(key_id, &sealer.public_key());
        let value = content.as_map()?.get(&entry)?;

        match SealedKey::from_value(value).and_then(|sealed| sealed.open(sealer)) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(id = %ctx.id, key = %key_id, error = %e, "could not open sealed key");
                None
            }
        }
    }
}

fn group_founder(ruleset: &Ruleset) -> Option<&Author> {
    match ruleset {
        Ruleset::Group { initial_admin } => Some(initial_admin),
        _ => None,
    }
}

impl PermissionEvaluator for GroupRulesEvaluator {
    fn determine_validity(&self, ctx: &ValidationContext<'_>, records: &mut [VerifiedTransaction]) {
        match &ctx.header.ruleset {
            Ruleset::UnsafeAllowAll => {
                for record in records.iter_mut().filter(|r| r.validity.is_pending()) {
                    record.validity = Validity::Valid;
                }
            }
            Ruleset::Group { initial_admin } => Self::judge_group(initial_admin, records),
            Ruleset::OwnedByGroup { group } => Self::judge_owned(ctx, group, records),
        }
    }

    fn read_key(&self, ctx: &ValidationContext<'_>, key_id: &KeyId) -> Option<KeySecret> {
        let known = self
            .keyring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_id)
            .cloned();
        if known.is_some() {
            return known;
        }
        if ctx.header.type_tag == CoValueType::Group {
            return None;
        }

        let key = self.sealed_key(ctx, key_id)?;
        self.keyring
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{
        map_set, CoValueHeader, CoValueRegistry, CryptoProvider, NonceMaterial, SessionId,
        SignerSecret, StandardCrypto, Transaction, TransactionId,
    };
    use serde_json::json;

    use crate::roles::Role;

    struct Member {
        secret: SignerSecret,
        session: SessionId,
    }

    impl Member {
        fn new(seed: u8) -> Self {
            let secret = SignerSecret::from_seed(&[seed; 32]);
            let session = SessionId::new(Author::Agent(secret.signer_id()), [seed; 8]);
            Self { secret, session }
        }

        fn author(&self) -> Author {
            Author::Agent(self.secret.signer_id())
        }
    }

    fn registry(evaluator: GroupRulesEvaluator) -> CoValueRegistry {
        CoValueRegistry::default().with_evaluator(Box::new(evaluator))
    }

    fn create(registry: &mut CoValueRegistry, header: CoValueHeader) -> CoValueId {
        let id = registry.crypto().covalue_id(&header);
        registry.provide_header(id, header, None, false).unwrap();
        id
    }

    fn write(registry: &mut CoValueRegistry, id: &CoValueId, by: &Member, change: serde_json::Value, at: i64) {
        let tx = Transaction::trusting(&[change], None, at).unwrap();
        registry.add_local_transaction(id, by.session, &by.secret, tx).unwrap();
    }

    fn valid_count(registry: &CoValueRegistry, id: &CoValueId) -> usize {
        registry.get(id).unwrap().ordered_valid_transactions().len()
    }

    fn group_of(admin: &Member) -> CoValueHeader {
        CoValueHeader::new(
            CoValueType::Group,
            Ruleset::Group {
                initial_admin: admin.author(),
            },
        )
    }

    #[test]
    fn test_only_admins_change_group() {
        let admin = Member::new(1);
        let outsider = Member::new(2);
        let mut registry = registry(GroupRulesEvaluator::default());
        let group = create(&mut registry, group_of(&admin));

        write(&mut registry, &group, &admin, Role::Writer.change_for(&outsider.author()), 1);
        write(&mut registry, &group, &outsider, Role::Admin.change_for(&outsider.author()), 2);

        assert_eq!(valid_count(&registry, &group), 1);
        let records = registry.get(&group).unwrap().pipeline().records();
        assert!(records
            .iter()
            .any(|r| r.validity == Validity::Invalid("author is not a group admin".into())));
    }

    #[test]
    fn test_promoted_admin_can_grant() {
        let admin = Member::new(1);
        let second = Member::new(2);
        let third = Member::new(3);
        let mut registry = registry(GroupRulesEvaluator::default());
        let group = create(&mut registry, group_of(&admin));

        write(&mut registry, &group, &admin, Role::Admin.change_for(&second.author()), 1);
        write(&mut registry, &group, &second, Role::Reader.change_for(&third.author()), 2);
        assert_eq!(valid_count(&registry, &group), 2);
    }

    #[test]
    fn test_owned_writes_follow_roles() {
        let admin = Member::new(1);
        let writer = Member::new(2);
        let reader = Member::new(3);
        let mut registry = registry(GroupRulesEvaluator::default());
        let group = create(&mut registry, group_of(&admin));
        write(&mut registry, &group, &admin, Role::Writer.change_for(&writer.author()), 1);
        write(&mut registry, &group, &admin, Role::Reader.change_for(&reader.author()), 1);

        let doc = create(
            &mut registry,
            CoValueHeader::new(CoValueType::Map, Ruleset::OwnedByGroup { group }),
        );
        write(&mut registry, &doc, &writer, map_set("a", json!(1)), 5);
        write(&mut registry, &doc, &reader, map_set("b", json!(2)), 5);
        write(&mut registry, &doc, &admin, map_set("c", json!(3)), 5);

        let content = registry.get(&doc).unwrap().content().unwrap();
        let map = content.as_map().unwrap();
        assert_eq!(map.get("a"), Some(&json!(1)));
        assert_eq!(map.get("b"), None);
        assert_eq!(map.get("c"), Some(&json!(3)));
    }

    #[test]
    fn test_revocation_applies_after_reset() {
        let admin = Member::new(1);
        let writer = Member::new(2);
        let mut registry = registry(GroupRulesEvaluator::default());
        let group = create(&mut registry, group_of(&admin));
        write(&mut registry, &group, &admin, Role::Writer.change_for(&writer.author()), 1);

        let doc = create(
            &mut registry,
            CoValueHeader::new(CoValueType::Map, Ruleset::OwnedByGroup { group }),
        );
        write(&mut registry, &doc, &writer, map_set("early", json!(1)), 5);
        write(&mut registry, &doc, &writer, map_set("late", json!(2)), 15);
        assert_eq!(valid_count(&registry, &doc), 2);

        write(&mut registry, &group, &admin, Role::Revoked.change_for(&writer.author()), 10);
        assert_eq!(valid_count(&registry, &doc), 1);
        let content = registry.get(&doc).unwrap().content().unwrap();
        assert!(content.as_map().unwrap().get("late").is_none());
    }

    #[test]
    fn test_missing_group_invalidates_until_arrival() {
        let admin = Member::new(1);
        let header = group_of(&admin);
        let group = StandardCrypto.covalue_id(&header);

        let mut registry = registry(GroupRulesEvaluator::default());
        let doc = create(
            &mut registry,
            CoValueHeader::new(CoValueType::Map, Ruleset::OwnedByGroup { group }),
        );
        write(&mut registry, &doc, &admin, map_set("a", json!(1)), 5);
        assert_eq!(valid_count(&registry, &doc), 0);

        create(&mut registry, header);
        assert_eq!(valid_count(&registry, &doc), 1);
    }

    #[test]
    fn test_private_transaction_read_via_sealed_key() {
        let admin = Member::new(1);
        let sealer = X25519StaticSecret::generate();
        let evaluator = GroupRulesEvaluator::default().with_sealer(sealer.clone());
        let ring = Arc::clone(evaluator.keyring());
        let mut registry = registry(evaluator);

        let group = create(&mut registry, group_of(&admin));
        let key = KeySecret::generate();
        let sealed = SealedKey::seal(group, &key, &sealer.public_key()).unwrap();
        write(
            &mut registry,
            &group,
            &admin,
            map_set(
                &SealedKey::entry_name(&key.key_id(), &sealer.public_key()),
                sealed.to_value().unwrap(),
            ),
            1,
        );

        let doc = create(
            &mut registry,
            CoValueHeader::new(CoValueType::Map, Ruleset::OwnedByGroup { group }),
        );
        let nonce = NonceMaterial {
            covalue: doc,
            tx: TransactionId::new(admin.session, 0),
        };
        let tx = Transaction::private(
            registry.crypto(),
            &key,
            &nonce,
            &[map_set("secret", json!("s3cr3t"))],
            None,
            5,
        )
        .unwrap();
        registry
            .add_local_transaction(&doc, admin.session, &admin.secret, tx)
            .unwrap();

        let content = registry.get(&doc).unwrap().content().unwrap();
        assert_eq!(content.as_map().unwrap().get("secret"), Some(&json!("s3cr3t")));
        assert!(ring.read().unwrap().contains(&key.key_id()));
    }

    #[test]
    fn test_private_transaction_without_key_stays_unread() {
        let admin = Member::new(1);
        let mut registry = registry(GroupRulesEvaluator::default());
        let group = create(&mut registry, group_of(&admin));
        let doc = create(
            &mut registry,
            CoValueHeader::new(CoValueType::Map, Ruleset::OwnedByGroup { group }),
        );
        let key = KeySecret::generate();
        let nonce = NonceMaterial {
            covalue: doc,
            tx: TransactionId::new(admin.session, 0),
        };
        let tx = Transaction::private(registry.crypto(), &key, &nonce, &[map_set("a", json!(1))], None, 5)
            .unwrap();
        registry
            .add_local_transaction(&doc, admin.session, &admin.secret, tx)
            .unwrap();

        let core = registry.get(&doc).unwrap();
        assert_eq!(core.pipeline().awaiting_keys(), 1);
        assert!(core.ordered_valid_transactions().is_empty());
    }
}
