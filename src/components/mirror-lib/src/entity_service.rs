use crate::canonical_store::CanonicalStore;
use crate::def::{CanonicalRecord, Entity, SaveEntityRequest};
use crate::error::{MirrorError, MirrorResult};
use crate::shard_conn::run_blocking;
use crate::shard_locator::ShardLocator;
use std::sync::Arc;

const MAX_MESSAGE_PAGE: usize = 1000;

/// Entity lookups and saves for the HTTP layer.
pub struct EntityService {
    locator: Arc<ShardLocator>,
    store: Arc<CanonicalStore>,
}

impl EntityService {
    pub fn new(locator: Arc<ShardLocator>, store: Arc<CanonicalStore>) -> Self {
        Self { locator, store }
    }

    async fn with_store<T, F>(&self, f: F) -> MirrorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CanonicalStore) -> MirrorResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        run_blocking("canonical store", move || f(&store)).await
    }

    async fn find_contact(
        &self,
        username: Option<String>,
        nickname: Option<String>,
    ) -> MirrorResult<Option<Entity>> {
        let contacts = self.locator.open_contact_shard().await?;
        run_blocking("contact lookup", move || match (username, nickname) {
            (Some(username), _) => contacts.find_contact_by_username(&username),
            (None, Some(nickname)) => contacts.find_contact_by_nickname(&nickname),
            (None, None) => Ok(None),
        })
        .await
    }

    pub async fn read_entity(&self, nickname: &str) -> MirrorResult<Entity> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(MirrorError::InvalidParam("nickname is required".to_string()));
        }

        let entity = self
            .find_contact(None, Some(nickname.to_string()))
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("no contact named {}", nickname)))?;
        self.annotate(entity).await
    }

    pub async fn read_entity_by_username(&self, username: &str) -> MirrorResult<Entity> {
        let username = username.trim();
        if username.is_empty() {
            return Err(MirrorError::InvalidParam("username is required".to_string()));
        }

        let entity = self
            .find_contact(Some(username.to_string()), None)
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("no contact {}", username)))?;
        self.annotate(entity).await
    }

    async fn annotate(&self, mut entity: Entity) -> MirrorResult<Entity> {
        let username = entity.username.clone();
        if let Some(saved) = self.with_store(move |store| store.get_entity(&username)).await? {
            entity.shard_name = saved.shard_name;
        }
        Ok(entity)
    }

    /// Resolves the entity's source shard, then persists the entity with it.
    ///
    /// The username must exist in the contact shard. The two steps are not
    /// one transaction. A shard resolved here may have changed by the time
    /// the entity row is written, and a failure between the steps leaves
    /// nothing persisted. Callers should treat a success as "eventually
    /// consistent" and retry on error.
    ///
    /// Once messages have been mirrored from an entity's shard, saving it
    /// against a different shard fails with `ShardReassignment`; use
    /// `reassign_entity` to move it on purpose.
    pub async fn save_entity(&self, request: SaveEntityRequest) -> MirrorResult<Entity> {
        let username = request.username.trim().to_string();
        let nickname = request.nickname.trim().to_string();
        if username.is_empty() || nickname.is_empty() {
            return Err(MirrorError::InvalidParam(
                "username and nickname are required".to_string(),
            ));
        }

        if self.find_contact(Some(username.clone()), None).await?.is_none() {
            let msg = format!("no contact {}, entity not saved", username);
            warn!("{}", msg);
            return Err(MirrorError::NotFound(msg));
        }

        let shard_name = self.locator.resolve(&username).await?;

        let entity = Entity {
            username,
            nickname,
            shard_name: Some(shard_name),
        };
        let entity = self
            .with_store(move |store| {
                if let Some(saved) = store.get_entity(&entity.username)? {
                    if let (Some(pinned), Some(resolved)) = (saved.shard_name, &entity.shard_name) {
                        if &pinned != resolved && store.has_records_from(&pinned, &entity.username)? {
                            let err = MirrorError::ShardReassignment {
                                username: entity.username.clone(),
                                pinned,
                                resolved: resolved.clone(),
                            };
                            warn!("{}", err);
                            return Err(err);
                        }
                    }
                }
                store.save_entity(&entity)?;
                Ok(entity)
            })
            .await?;

        info!(
            "entity {} saved with shard {:?}",
            entity.username, entity.shard_name
        );
        Ok(entity)
    }

    /// Explicit migration: drops the cached resolution, resolves again and
    /// overwrites the stored shard even if messages were already mirrored.
    pub async fn reassign_entity(&self, username: &str) -> MirrorResult<Entity> {
        let key = username.to_string();
        let mut entity = self
            .with_store(move |store| store.get_entity(&key))
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("entity {} is not saved", username)))?;

        self.locator.invalidate(username);
        let shard_name = self.locator.resolve(username).await?;
        if entity.shard_name.as_deref() != Some(shard_name.as_str()) {
            warn!(
                "entity {} moved from shard {:?} to {}",
                username, entity.shard_name, shard_name
            );
        }

        entity.shard_name = Some(shard_name);
        self.with_store(move |store| {
            store.save_entity(&entity)?;
            Ok(entity)
        })
        .await
    }

    pub async fn read_messages(
        &self,
        username: &str,
        after_id: u64,
        limit: usize,
    ) -> MirrorResult<Vec<CanonicalRecord>> {
        let limit = limit.clamp(1, MAX_MESSAGE_PAGE);
        let username = username.to_string();
        self.with_store(move |store| store.list_messages(&username, after_id, limit))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sync_scheduler::SyncScheduler;
    use crate::test_support::*;

    fn service(fixture: &ShardFixture) -> (EntityService, Arc<ShardLocator>, Arc<CanonicalStore>) {
        let locator = Arc::new(fixture.locator());
        let store = fixture.store();
        (
            EntityService::new(locator.clone(), store.clone()),
            locator,
            store,
        )
    }

    fn request(username: &str, nickname: &str) -> SaveEntityRequest {
        SaveEntityRequest {
            username: username.to_string(),
            nickname: nickname.to_string(),
        }
    }

    #[tokio::test]
    async fn test_read_entity() {
        let fixture = ShardFixture::new();
        fixture.add_contact_shard(&[("wxid_alice", "Alice"), ("wxid_bob", "Bob")]);
        let (service, _, store) = service(&fixture);

        let alice = service.read_entity("Alice").await.unwrap();
        assert_eq!(alice.username, "wxid_alice");
        assert_eq!(alice.shard_name, None);

        let err = service.read_entity("Carol").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            service.read_entity(" ").await,
            Err(MirrorError::InvalidParam(_))
        ));

        // reads never write
        assert_eq!(store.get_entity("wxid_alice").unwrap(), None);

        let bob = service.read_entity_by_username("wxid_bob").await.unwrap();
        assert_eq!(bob.nickname, "Bob");
    }

    #[tokio::test]
    async fn test_save_entity_resolves_shard() {
        let fixture = ShardFixture::new();
        fixture.add_contact_shard(&[("wxid_alice", "Alice")]);
        fixture.add_message_shard("msg_0", &[(1, "wxid_bob", "hey")]);
        fixture.add_message_shard("msg_1", &[(1, "wxid_alice", "hi")]);
        let (service, _, store) = service(&fixture);

        let saved = service.save_entity(request("wxid_alice", "Alice")).await.unwrap();
        assert_eq!(saved.shard_name.as_deref(), Some("msg_1"));
        assert_eq!(store.get_entity("wxid_alice").unwrap(), Some(saved));

        let read = service.read_entity("Alice").await.unwrap();
        assert_eq!(read.shard_name.as_deref(), Some("msg_1"));

        let err = service
            .save_entity(request("wxid_nobody", "Nobody"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.get_entity("wxid_nobody").unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_entity_requires_known_contact() {
        let fixture = ShardFixture::new();
        fixture.add_contact_shard(&[("wxid_alice", "Alice")]);
        fixture.add_message_shard("msg_0", &[(1, "wxid_ghost", "boo")]);
        let (service, locator, store) = service(&fixture);

        // messages exist but the contact does not
        let err = service
            .save_entity(request("wxid_ghost", "Ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.get_entity("wxid_ghost").unwrap(), None);
        // rejected before any shard resolution
        assert!(!locator.is_cached("msg_0"));
    }

    #[tokio::test]
    async fn test_pinned_shard_needs_explicit_migration() {
        let fixture = ShardFixture::new();
        fixture.add_contact_shard(&[("wxid_alice", "Alice")]);
        fixture.add_message_shard("msg_1", &[(1, "wxid_alice", "hi")]);
        let (service, locator, store) = service(&fixture);

        service.save_entity(request("wxid_alice", "Alice")).await.unwrap();

        let scheduler = SyncScheduler::new(
            SyncConfig::default(),
            locator.clone(),
            store.clone(),
            fixture.assigner(),
        );
        scheduler.tick().await;
        assert!(store.has_records_from("msg_1", "wxid_alice").unwrap());

        // alice now also shows up in an earlier shard
        fixture.add_message_shard("msg_0", &[(1, "wxid_alice", "again")]);
        locator.invalidate("wxid_alice");

        let err = service
            .save_entity(request("wxid_alice", "Alice2"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::ShardReassignment { .. }));
        let kept = store.get_entity("wxid_alice").unwrap().unwrap();
        assert_eq!(kept.shard_name.as_deref(), Some("msg_1"));
        assert_eq!(kept.nickname, "Alice");

        let moved = service.reassign_entity("wxid_alice").await.unwrap();
        assert_eq!(moved.shard_name.as_deref(), Some("msg_0"));
        assert_eq!(
            store.get_entity("wxid_alice").unwrap().unwrap().shard_name.as_deref(),
            Some("msg_0")
        );
    }

    #[tokio::test]
    async fn test_read_messages_pages_by_id() {
        let fixture = ShardFixture::new();
        fixture.add_message_shard(
            "msg_0",
            &[(1, "wxid_alice", "a"), (2, "wxid_bob", "b"), (3, "wxid_alice", "c")],
        );
        let (service, locator, store) = service(&fixture);
        let scheduler =
            SyncScheduler::new(SyncConfig::default(), locator, store, fixture.assigner());
        scheduler.tick().await;

        let page = service.read_messages("wxid_alice", 0, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].payload.content, "a");

        let rest = service
            .read_messages("wxid_alice", page[0].id, 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload.content, "c");
    }
}
