use std::path::Path;

use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Schema,
};
use time::OffsetDateTime;
use tracing::warn;

use crate::entities;
use crate::entities::credentials::{ActiveModel, Column};
use crate::record::CredentialRecord;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// SQLite-backed credential vault, one row per `(provider, account)`.
///
/// Writes go through SQLite's own serialization; the DSN carries a 5 s busy
/// timeout so concurrent writers back off instead of failing.
#[derive(Clone)]
pub struct CredentialStore {
    db: DatabaseConnection,
}

impl CredentialStore {
    /// Opens (creating if needed) the store under `data_dir`.
    ///
    /// The directory is created with owner-only permissions; the tokens in
    /// here grant full account access.
    pub async fn open(data_dir: &Path) -> StoreResult<Self> {
        create_private_dir(data_dir)?;
        let db_path = data_dir.join("credentials.db");
        let dsn = sqlite_dsn(&db_path);
        Self::connect(&dsn).await
    }

    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA busy_timeout = 5000").await?;
        }
        let store = Self { db };
        store.sync().await?;
        Ok(store)
    }

    /// Entity-first schema sync; safe to run on every start.
    async fn sync(&self) -> StoreResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Credentials)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    pub async fn get(&self, provider: &str, account: u32) -> StoreResult<Option<CredentialRecord>> {
        let row = entities::Credentials::find_by_id((provider.to_string(), i64::from(account)))
            .one(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        match serde_json::from_value::<CredentialRecord>(row.secret.clone()) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // Corruption must not cascade: drop the row and report absence.
                warn!(provider, account, %err, "deleting undecodable credential row");
                entities::Credentials::delete_by_id((provider.to_string(), i64::from(account)))
                    .exec(&self.db)
                    .await?;
                Ok(None)
            }
        }
    }

    /// All usable-or-not records for a provider, ordered by account.
    pub async fn get_all(&self, provider: &str) -> StoreResult<Vec<(u32, CredentialRecord)>> {
        let rows = entities::Credentials::find()
            .filter(Column::Provider.eq(provider))
            .order_by_asc(Column::Account)
            .all(&self.db)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<CredentialRecord>(row.secret.clone()) {
                Ok(record) => out.push((row.account as u32, record)),
                Err(err) => {
                    warn!(
                        provider,
                        account = row.account,
                        %err,
                        "deleting undecodable credential row"
                    );
                    entities::Credentials::delete_by_id((row.provider.clone(), row.account))
                        .exec(&self.db)
                        .await?;
                }
            }
        }
        Ok(out)
    }

    pub async fn save(
        &self,
        provider: &str,
        account: u32,
        record: &CredentialRecord,
    ) -> StoreResult<()> {
        let now = OffsetDateTime::now_utc();
        let secret = serde_json::to_value(record)?;
        let existing = entities::Credentials::find_by_id((provider.to_string(), i64::from(account)))
            .one(&self.db)
            .await?;
        match existing {
            Some(model) => {
                let mut active: ActiveModel = model.into();
                active.secret = ActiveValue::Set(secret);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                ActiveModel {
                    provider: ActiveValue::Set(provider.to_string()),
                    account: ActiveValue::Set(i64::from(account)),
                    secret: ActiveValue::Set(secret),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    /// Removes one slot, or every slot for the provider when `account` is
    /// omitted.
    pub async fn remove(&self, provider: &str, account: Option<u32>) -> StoreResult<()> {
        let mut delete = entities::Credentials::delete_many().filter(Column::Provider.eq(provider));
        if let Some(account) = account {
            delete = delete.filter(Column::Account.eq(i64::from(account)));
        }
        delete.exec(&self.db).await?;
        Ok(())
    }

    /// Next dense slot index: `max(account) + 1`, or 0 when empty.
    pub async fn next_account(&self, provider: &str) -> StoreResult<u32> {
        let rows = self.get_all(provider).await?;
        Ok(rows.last().map(|(account, _)| account + 1).unwrap_or(0))
    }

    pub async fn count(&self, provider: &str) -> StoreResult<u32> {
        Ok(self.get_all(provider).await?.len() as u32)
    }

    /// Re-match a freshly obtained identity against existing slots so that
    /// logging in again reuses the same account number.
    pub async fn find_by_identity(
        &self,
        provider: &str,
        candidate: &CredentialRecord,
    ) -> StoreResult<Option<u32>> {
        for (account, record) in self.get_all(provider).await? {
            if record.same_identity(candidate) {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    /// True iff any stored credential for the provider can start new flows.
    pub async fn exists(&self, provider: &str) -> StoreResult<bool> {
        Ok(self
            .get_all(provider)
            .await?
            .iter()
            .any(|(_, record)| record.usable()))
    }
}

fn sqlite_dsn(path: &Path) -> String {
    let display = path.to_string_lossy();
    if display.starts_with('/') {
        format!("sqlite:///{}?mode=rwc", display.trim_start_matches('/'))
    } else {
        format!("sqlite://{display}?mode=rwc")
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
