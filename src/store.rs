//! Parcel Store (C7): `sqlx` + SQLite persistence for parcels, history
//! snapshots, user-parcel links, proxies, users and auth tokens.
//!
//! A single-node aggregation service has no need for a client/server RDBMS;
//! SQLite is the natural substitution for the original's MySQL backing (see
//! DESIGN.md). Table shapes follow spec.md §4.7 exactly.

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::carriers;
use crate::error::{OpenParcelError, Result};
use crate::model::{HistorySnapshot, Parcel, Proxy, ProxyProtocol, User, UserParcelLink, ValidCarrier};

#[derive(Clone)]
pub struct ParcelStore {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS parcels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    carrier_id TEXT NOT NULL,
    tracking_code TEXT NOT NULL,
    created TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    UNIQUE(carrier_id, tracking_code)
);

CREATE TABLE IF NOT EXISTS history_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parcel_id INTEGER NOT NULL REFERENCES parcels(id) ON DELETE CASCADE,
    retrieved TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_parcels (
    user_id INTEGER NOT NULL,
    parcel_id INTEGER NOT NULL REFERENCES parcels(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, parcel_id)
);

CREATE TABLE IF NOT EXISTS proxies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    addr TEXT NOT NULL,
    port INTEGER NOT NULL,
    country TEXT,
    speed REAL,
    protocol TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    carriers TEXT NOT NULL DEFAULT '[]',
    UNIQUE(addr, port, protocol)
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    salt TEXT NOT NULL,
    access_level INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    description TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1
);
"#;

impl ParcelStore {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let url = format!("sqlite://{db_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(&url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    // ---- parcels -------------------------------------------------------

    pub async fn find_parcel_by_natural_key_any_age(
        &self,
        carrier_id: &str,
        tracking_code: &str,
    ) -> Result<Option<Parcel>> {
        Ok(sqlx::query_as::<_, Parcel>(
            "SELECT id, carrier_id, tracking_code, created, slug FROM parcels \
             WHERE carrier_id = ?1 AND tracking_code = ?2",
        )
        .bind(carrier_id)
        .bind(tracking_code)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_parcel_by_slug(&self, slug: &str) -> Result<Option<Parcel>> {
        Ok(sqlx::query_as::<_, Parcel>(
            "SELECT id, carrier_id, tracking_code, created, slug FROM parcels WHERE slug = ?1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Inserts a new parcel row with a freshly generated, collision-checked
    /// slug, returning the persisted row.
    pub async fn insert_parcel(&self, carrier_id: &str, tracking_code: &str) -> Result<Parcel> {
        let now = Utc::now();
        let mut slug = carriers::generate_slug(carrier_id, tracking_code);
        while self.find_parcel_by_slug(&slug).await?.is_some() {
            slug = carriers::generate_slug(carrier_id, tracking_code);
        }

        let id = sqlx::query(
            "INSERT INTO parcels (carrier_id, tracking_code, created, slug) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(carrier_id)
        .bind(tracking_code)
        .bind(now.to_rfc3339())
        .bind(&slug)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Parcel {
            id,
            carrier_id: carrier_id.to_string(),
            tracking_code: tracking_code.to_string(),
            created: now,
            slug,
        })
    }

    // ---- history snapshots ----------------------------------------------

    pub async fn insert_snapshot(
        &self,
        parcel_id: i64,
        data: &serde_json::Value,
    ) -> Result<HistorySnapshot> {
        let now = Utc::now();
        let id = sqlx::query("INSERT INTO history_cache (parcel_id, retrieved, data) VALUES (?1, ?2, ?3)")
            .bind(parcel_id)
            .bind(now.to_rfc3339())
            .bind(serde_json::to_string(data).unwrap_or_else(|_| "null".to_string()))
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        Ok(HistorySnapshot {
            id,
            parcel_id,
            retrieved: now,
            data: data.clone(),
        })
    }

    /// Snapshots for `parcel_id`, most recent first.
    pub async fn latest_snapshot(&self, parcel_id: i64) -> Result<Option<HistorySnapshot>> {
        let row: Option<(i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, parcel_id, retrieved, data FROM history_cache \
             WHERE parcel_id = ?1 ORDER BY retrieved DESC, id DESC LIMIT 1",
        )
        .bind(parcel_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, parcel_id, retrieved, data)| HistorySnapshot {
            id,
            parcel_id,
            retrieved: retrieved.parse().unwrap_or_else(|_| Utc::now()),
            data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        }))
    }

    // ---- user-parcel links -----------------------------------------------

    pub async fn find_link(&self, user_id: i64, parcel_id: i64) -> Result<Option<UserParcelLink>> {
        let row: Option<(i64, i64, String, bool)> = sqlx::query_as(
            "SELECT user_id, parcel_id, name, archived FROM user_parcels \
             WHERE user_id = ?1 AND parcel_id = ?2",
        )
        .bind(user_id)
        .bind(parcel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(user_id, parcel_id, name, archived)| UserParcelLink {
            user_id,
            parcel_id,
            name,
            archived,
        }))
    }

    pub async fn find_link_by_slug(&self, user_id: i64, slug: &str) -> Result<Option<(Parcel, UserParcelLink)>> {
        let Some(parcel) = self.find_parcel_by_slug(slug).await? else {
            return Ok(None);
        };
        let Some(link) = self.find_link(user_id, parcel.id).await? else {
            return Ok(None);
        };
        Ok(Some((parcel, link)))
    }

    pub async fn save_link(&self, user_id: i64, parcel_id: i64, name: &str) -> Result<()> {
        if self.find_link(user_id, parcel_id).await?.is_some() {
            return Err(OpenParcelError::Conflict {
                title: "Already saved",
                message: "This parcel is already in your list.".to_string(),
            });
        }
        sqlx::query(
            "INSERT INTO user_parcels (user_id, parcel_id, name, archived) VALUES (?1, ?2, ?3, 0)",
        )
        .bind(user_id)
        .bind(parcel_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_link(&self, user_id: i64, parcel_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM user_parcels WHERE user_id = ?1 AND parcel_id = ?2")
            .bind(user_id)
            .bind(parcel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_archived(&self, user_id: i64, parcel_id: i64, archived: bool) -> Result<()> {
        let link = self.find_link(user_id, parcel_id).await?;
        match link {
            Some(link) if link.archived == archived => Err(OpenParcelError::Conflict {
                title: "No change",
                message: "Archived state is already set to that value.".to_string(),
            }),
            Some(_) => {
                sqlx::query("UPDATE user_parcels SET archived = ?1 WHERE user_id = ?2 AND parcel_id = ?3")
                    .bind(archived)
                    .bind(user_id)
                    .bind(parcel_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            None => Err(OpenParcelError::ParcelNotFound),
        }
    }

    pub async fn list_user_parcels(&self, user_id: i64) -> Result<Vec<(Parcel, UserParcelLink)>> {
        let rows: Vec<(i64, String, String, String, String, i64, i64, String, bool)> = sqlx::query_as(
            "SELECT p.id, p.carrier_id, p.tracking_code, p.created, p.slug, \
                    up.user_id, up.parcel_id, up.name, up.archived \
             FROM user_parcels up JOIN parcels p ON p.id = up.parcel_id \
             WHERE up.user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, carrier_id, tracking_code, created, slug, uid, pid, name, archived)| {
                (
                    Parcel {
                        id,
                        carrier_id,
                        tracking_code,
                        created: created.parse().unwrap_or_else(|_| Utc::now()),
                        slug,
                    },
                    UserParcelLink {
                        user_id: uid,
                        parcel_id: pid,
                        name,
                        archived,
                    },
                )
            })
            .collect())
    }

    // ---- proxies ----------------------------------------------------------

    pub async fn list_active_proxies(&self) -> Result<Vec<Proxy>> {
        let rows: Vec<(i64, String, i64, Option<String>, Option<f64>, String, bool, String)> =
            sqlx::query_as(
                "SELECT id, addr, port, country, speed, protocol, active, carriers \
                 FROM proxies WHERE active = 1",
            )
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_proxy).collect())
    }

    pub async fn import_proxy(&self, addr: &str, port: u16, protocol: ProxyProtocol) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO proxies (addr, port, protocol, active, carriers) \
             VALUES (?1, ?2, ?3, 1, '[]')",
        )
        .bind(addr)
        .bind(port as i64)
        .bind(protocol.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_proxy(&self, proxy: &Proxy) -> Result<()> {
        let carriers_json = serde_json::to_string(&proxy.valid_carriers).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            "INSERT INTO proxies (id, addr, port, country, speed, protocol, active, carriers) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(addr, port, protocol) DO UPDATE SET \
                country = excluded.country, speed = excluded.speed, \
                active = excluded.active, carriers = excluded.carriers",
        )
        .bind(proxy.id)
        .bind(&proxy.addr)
        .bind(proxy.port as i64)
        .bind(&proxy.country)
        .bind(proxy.speed_ms.map(|v| v as f64))
        .bind(proxy.protocol.as_str())
        .bind(proxy.active)
        .bind(carriers_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- users / auth tokens -----------------------------------------------

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT id, username, password as password_hash, salt, access_level \
             FROM users WHERE username = ?1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn insert_user(&self, username: &str, password_hash: &str, salt: &str) -> Result<User> {
        if self.find_user_by_username(username).await?.is_some() {
            return Err(OpenParcelError::Conflict {
                title: "Username taken",
                message: "That username is already registered.".to_string(),
            });
        }
        let id = sqlx::query(
            "INSERT INTO users (username, password, salt, access_level) VALUES (?1, ?2, ?3, 0)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(salt)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            salt: salt.to_string(),
            access_level: 0,
        })
    }

    pub async fn find_auth_token(&self, token: &str) -> Result<Option<AuthTokenRow>> {
        Ok(sqlx::query_as::<_, AuthTokenRow>(
            "SELECT token, user_id, description, active FROM auth_tokens WHERE token = ?1 AND active = 1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn insert_auth_token(&self, user_id: i64, token: &str, description: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_tokens (token, user_id, description, active) VALUES (?1, ?2, ?3, 1)",
        )
        .bind(token)
        .bind(user_id)
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_auth_token(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE auth_tokens SET active = 0 WHERE token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_proxy(
    row: (i64, String, i64, Option<String>, Option<f64>, String, bool, String),
) -> Proxy {
    let (id, addr, port, country, speed, protocol, active, carriers_json) = row;
    Proxy {
        id,
        addr,
        port: port as u16,
        protocol: protocol.parse().unwrap_or(ProxyProtocol::Http),
        country,
        speed_ms: speed.map(|v| v as u64),
        active,
        valid_carriers: serde_json::from_str::<Vec<ValidCarrier>>(&carriers_json).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthTokenRow {
    pub token: String,
    pub user_id: i64,
    pub description: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inserting_a_parcel_generates_a_unique_valid_slug() {
        let store = ParcelStore::connect_in_memory().await.unwrap();
        let parcel = store.insert_parcel("ctt", "RR123456789PT").await.unwrap();
        assert!(carriers::is_slug_valid(&parcel.slug));
        assert!(
            store
                .find_parcel_by_natural_key_any_age("ctt", "RR123456789PT")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn saving_the_same_link_twice_conflicts() {
        let store = ParcelStore::connect_in_memory().await.unwrap();
        let parcel = store.insert_parcel("dhl", "JD0123456789").await.unwrap();
        store.save_link(1, parcel.id, "my parcel").await.unwrap();
        let err = store.save_link(1, parcel.id, "my parcel").await.unwrap_err();
        assert!(matches!(err, OpenParcelError::Conflict { .. }));
    }

    #[tokio::test]
    async fn archive_toggle_then_delete_leaves_an_empty_list() {
        let store = ParcelStore::connect_in_memory().await.unwrap();
        let parcel = store.insert_parcel("dpd-pt", "ABC123").await.unwrap();
        store.save_link(7, parcel.id, "home").await.unwrap();
        store.set_archived(7, parcel.id, true).await.unwrap();
        assert!(store.set_archived(7, parcel.id, true).await.is_err());
        store.delete_link(7, parcel.id).await.unwrap();
        assert!(store.list_user_parcels(7).await.unwrap().is_empty());
    }
}
