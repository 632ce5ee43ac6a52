// Stream Repository Factory
//
// Resolves named agent and session settings, opens a session through a
// connector, and hands back a stream repository ready for one unit of
// work.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{MultipleStreamRepository, SingleStreamRepository, StreamError, StreamHandle};
use crate::agent::AgentSignatureProvider;
use crate::config::RepositoryConfig;
use crate::log::SourceConnector;
use crate::provision::ProvisionGuard;

type Repository<C> = <C as SourceConnector>::Repository;

/// How a single-stream repository resolves its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolve {
    LoadOrCreate,
    Create,
    Load,
}

pub struct StreamRepositoryFactory<C> {
    connector: C,
    config: RepositoryConfig,
    guard: Arc<ProvisionGuard>,
}

impl<C: SourceConnector> StreamRepositoryFactory<C> {
    pub fn new(connector: C, config: RepositoryConfig, guard: Arc<ProvisionGuard>) -> Self {
        Self {
            connector,
            config,
            guard,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn guard(&self) -> &ProvisionGuard {
        &self.guard
    }

    /// Open a session and wrap it for multi-stream use.
    pub async fn create_multiple(
        &self,
        agent: &str,
        session: &str,
    ) -> Result<MultipleStreamRepository<Repository<C>>, StreamError> {
        let signer: Arc<dyn AgentSignatureProvider> = Arc::new(self.config.agent(agent)?.clone());
        let options = self.config.session(session)?;

        let repository = self.connector.connect(options, &self.guard).await?;
        tracing::debug!(%agent, %session, read_only = options.read_only, "session opened");

        Ok(MultipleStreamRepository::new(repository, signer))
    }

    /// Single stream for `key`, created if it does not exist yet.
    pub async fn create_single(
        &self,
        agent: &str,
        session: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<SingleStreamRepository<Repository<C>>, StreamError> {
        self.single(agent, session, key, Resolve::LoadOrCreate, cancel)
            .await
    }

    /// Single stream for `key`, assumed not to exist yet.
    pub async fn create_single_for_new(
        &self,
        agent: &str,
        session: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<SingleStreamRepository<Repository<C>>, StreamError> {
        self.single(agent, session, key, Resolve::Create, cancel)
            .await
    }

    /// Single stream for `key`, which must already exist.
    pub async fn create_single_for_existing(
        &self,
        agent: &str,
        session: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<SingleStreamRepository<Repository<C>>, StreamError> {
        self.single(agent, session, key, Resolve::Load, cancel)
            .await
    }

    async fn single(
        &self,
        agent: &str,
        session: &str,
        key: &str,
        resolve: Resolve,
        cancel: &CancellationToken,
    ) -> Result<SingleStreamRepository<Repository<C>>, StreamError> {
        let mut multi = self.create_multiple(agent, session).await?;

        let resolved: Result<StreamHandle, StreamError> = match resolve {
            Resolve::LoadOrCreate => multi.load_or_create(key, cancel).await,
            Resolve::Create => multi.create(key),
            Resolve::Load => multi.load(key, cancel).await,
        };

        match resolved {
            Ok(_) => SingleStreamRepository::new(multi, key),
            Err(err) => {
                if let Err(dispose_err) = multi.dispose().await {
                    tracing::warn!(
                        stream = %key,
                        error = %dispose_err,
                        "dispose after failed resolve"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryEngine;
    use crate::config::{ConfigError, DEFAULT_NAME, READ_ONLY_SESSION};
    use crate::envelope::{DataType, Delta, Payload};
    use crate::log::RepositoryError;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Opened;

    impl Payload for Opened {
        fn data_type(&self) -> DataType {
            DataType::rust("account.opened")
        }
    }

    impl Delta for Opened {}

    fn factory(engine: &MemoryEngine) -> StreamRepositoryFactory<MemoryEngine> {
        StreamRepositoryFactory::new(
            engine.clone(),
            RepositoryConfig::default_config(),
            Arc::new(ProvisionGuard::new()),
        )
    }

    #[tokio::test]
    async fn provisions_once_across_sessions() {
        let engine = MemoryEngine::new();
        let factory = factory(&engine);

        factory.create_multiple(DEFAULT_NAME, DEFAULT_NAME).await.unwrap();
        factory.create_multiple(DEFAULT_NAME, DEFAULT_NAME).await.unwrap();

        assert_eq!(engine.provision_count(), 1);
        assert!(factory.guard().is_provisioned());
    }

    #[tokio::test]
    async fn unknown_names_are_config_errors() {
        let engine = MemoryEngine::new();
        let factory = factory(&engine);

        assert!(matches!(
            factory.create_multiple("nobody", DEFAULT_NAME).await,
            Err(StreamError::Config(ConfigError::UnknownAgent(_)))
        ));
        assert!(matches!(
            factory.create_multiple(DEFAULT_NAME, "nowhere").await,
            Err(StreamError::Config(ConfigError::UnknownSession(_)))
        ));
    }

    #[tokio::test]
    async fn resolution_policies() {
        let engine = MemoryEngine::new();
        let factory = factory(&engine);
        let cancel = CancellationToken::new();

        assert!(matches!(
            factory
                .create_single_for_existing(DEFAULT_NAME, DEFAULT_NAME, "acct-1", &cancel)
                .await,
            Err(StreamError::UnknownStreamKey(key)) if key == "acct-1"
        ));

        let mut fresh = factory
            .create_single_for_new(DEFAULT_NAME, DEFAULT_NAME, "acct-1", &cancel)
            .await
            .unwrap();
        assert!(fresh.is_new());
        fresh.append(&Opened).unwrap();
        assert!(fresh.commit(&cancel).await.unwrap());
        let id = fresh.stream().id();
        fresh.dispose().await.unwrap();

        let existing = factory
            .create_single_for_existing(DEFAULT_NAME, DEFAULT_NAME, "acct-1", &cancel)
            .await
            .unwrap();
        assert_eq!(existing.stream().id(), id);
        assert!(!existing.is_new());

        let either = factory
            .create_single(DEFAULT_NAME, DEFAULT_NAME, "acct-2", &cancel)
            .await
            .unwrap();
        assert!(either.is_new());
    }

    #[tokio::test]
    async fn read_only_session_rejects_commit() {
        let engine = MemoryEngine::new();
        let factory = factory(&engine);
        let cancel = CancellationToken::new();

        let mut single = factory
            .create_single(DEFAULT_NAME, READ_ONLY_SESSION, "acct-9", &cancel)
            .await
            .unwrap();
        single.append(&Opened).unwrap();

        assert!(matches!(
            single.commit(&cancel).await,
            Err(StreamError::Repository(RepositoryError::ReadOnly))
        ));
    }
}
