//! Orchestration layer binding the Carrier Registry (C1), Scraper Driver
//! (C2), Scraping Pool (C5), Freshness Cache (C6), Parcel Store (C7) and
//! Proxy Manager (C4) into the operations `bin/server.rs`'s handlers call.
//!
//! Plays the role `app.py`'s `track` route played in the original: the
//! thing that decides "serve cached, or scrape", admits into the pool, and
//! merges a joined waiter's view back onto the row the admitting caller
//! persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::Value;

use crate::cache::{CacheDecision, FreshnessPolicy};
use crate::carriers;
use crate::config::Config;
use crate::driver::{DriverSettings, ScraperDriver};
use crate::error::{OpenParcelError, Result};
use crate::model::{HistorySnapshot, Parcel, Proxy, User, UserParcelLink};
use crate::pool::{ParcelKey, PersistedOutcome, PoolOutcome, ScrapeOutcome, ScrapingPool};
use crate::proxy::ProxyManager;
use crate::proxy::config::ProxyConfig;
use crate::store::ParcelStore;

/// What a tracking request resolves to once cache/scrape has settled: the
/// parcel identity, its latest snapshot, and — when the caller is
/// authenticated and has this parcel saved — their own link metadata.
#[derive(Debug, Clone)]
pub struct TrackResult {
    pub parcel: Parcel,
    pub snapshot: HistorySnapshot,
    pub link: Option<UserParcelLink>,
    pub cached: bool,
    pub outdated: bool,
}

pub struct Service {
    pub store: ParcelStore,
    pub pool: Arc<ScrapingPool>,
    pub proxy_manager: ProxyManager,
    pub freshness: FreshnessPolicy,
    pub config: Config,
}

impl Service {
    pub fn new(store: ParcelStore, config: Config) -> Self {
        let pool = Arc::new(ScrapingPool::new(config.max_instances));
        let proxy_manager = ProxyManager::new(store.clone());
        let freshness = FreshnessPolicy::new(Duration::from_secs(config.refresh_timeout_secs));
        Self {
            store,
            pool,
            proxy_manager,
            freshness,
            config,
        }
    }

    fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.config.admission_timeout_secs)
    }

    fn carrier_descriptor(&self, carrier_id: &str) -> Result<&'static carriers::CarrierDescriptor> {
        carriers::by_id(carrier_id)
            .map(|entry| entry.descriptor)
            .ok_or(OpenParcelError::CarrierNotFound)
    }

    /// Track by `(carrier_id, tracking_code)` (spec.md §6's
    /// `/track/<carrier_id>/<code>`). Creates a new parcel row the first
    /// time a natural key is seen.
    pub async fn track_by_natural_key(
        &self,
        carrier_id: &str,
        tracking_code: &str,
        user: Option<&User>,
        force: bool,
    ) -> Result<TrackResult> {
        if !carriers::is_tracking_code_valid(tracking_code) {
            return Err(OpenParcelError::TrackingCodeInvalid);
        }
        let descriptor = self.carrier_descriptor(carrier_id)?;

        let existing = self
            .store
            .find_parcel_by_natural_key_any_age(carrier_id, tracking_code)
            .await?;

        let link = match (&existing, user) {
            (Some(parcel), Some(user)) => self.store.find_link(user.id, parcel.id).await?,
            _ => None,
        };
        let archived = link.as_ref().map(|l| l.archived).unwrap_or(false);

        let decision = match &existing {
            Some(parcel) if !parcel.is_outdated(descriptor.outdated_period_days, Utc::now()) => {
                let latest = self.store.latest_snapshot(parcel.id).await?;
                match latest {
                    Some(snapshot) => self.freshness.decide_by_natural_key(
                        archived,
                        snapshot.retrieved,
                        force,
                        Utc::now(),
                    ),
                    None => CacheDecision::Scrape,
                }
            }
            // Outdated or never-seen: always scrape a fresh attempt.
            _ => CacheDecision::Scrape,
        };

        match decision {
            CacheDecision::ServeCached => {
                let parcel = existing.expect("ServeCached implies a cached parcel exists");
                let snapshot = self
                    .store
                    .latest_snapshot(parcel.id)
                    .await?
                    .ok_or(OpenParcelError::ParcelNotFound)?;
                Ok(TrackResult {
                    parcel,
                    snapshot,
                    link,
                    cached: true,
                    outdated: false,
                })
            }
            CacheDecision::Scrape => {
                self.scrape_and_merge(
                    ParcelKey {
                        carrier_id: carrier_id.to_string(),
                        tracking_code: tracking_code.to_string(),
                        slug: existing.as_ref().map(|p| p.slug.clone()),
                    },
                    user,
                )
                .await
            }
        }
    }

    /// Track by slug (spec.md §6's `/track/<parcel_slug>`). Restricted to the
    /// owner: a slug only resolves for the user who has it saved, so an
    /// unauthenticated caller or a caller without a matching
    /// `UserParcelLink` gets the same `ParcelNotFound` an unknown slug
    /// would, never another user's history. Never creates a new parcel —
    /// an unknown slug is a 404.
    pub async fn track_by_slug(&self, slug: &str, user: Option<&User>, force: bool) -> Result<TrackResult> {
        if !carriers::is_slug_valid(slug) {
            return Err(OpenParcelError::SlugInvalid);
        }
        let user = user.ok_or(OpenParcelError::ParcelNotFound)?;
        let (parcel, link) = self
            .store
            .find_link_by_slug(user.id, slug)
            .await?
            .ok_or(OpenParcelError::ParcelNotFound)?;
        let descriptor = self.carrier_descriptor(&parcel.carrier_id)?;

        let archived = link.archived;
        let outdated = crate::cache::is_outdated(parcel.created, descriptor.outdated_period_days, Utc::now());

        let snapshot = self.store.latest_snapshot(parcel.id).await?;
        let decision = match &snapshot {
            Some(snapshot) => self.freshness.decide_by_slug(
                archived,
                parcel.created,
                snapshot.retrieved,
                descriptor.outdated_period_days,
                force,
                Utc::now(),
            ),
            None => CacheDecision::Scrape,
        };

        match decision {
            CacheDecision::ServeCached => {
                let snapshot = snapshot.ok_or(OpenParcelError::ParcelNotFound)?;
                Ok(TrackResult {
                    parcel,
                    snapshot,
                    link: Some(link),
                    cached: true,
                    outdated,
                })
            }
            CacheDecision::Scrape => {
                self.scrape_and_merge(
                    ParcelKey {
                        carrier_id: parcel.carrier_id.clone(),
                        tracking_code: parcel.tracking_code.clone(),
                        slug: Some(parcel.slug.clone()),
                    },
                    Some(user),
                )
                .await
            }
        }
    }

    /// Admits (or joins) a scraping operation for `key`, then builds a
    /// [`TrackResult`] either from what this call persisted (Admitted) or
    /// from what the admitting caller persisted (Joined) — preserving this
    /// caller's own user-link, never the admitting caller's.
    async fn scrape_and_merge(&self, key: ParcelKey, user: Option<&User>) -> Result<TrackResult> {
        let carrier_id = key.carrier_id.clone();
        let tracking_code = key.tracking_code.clone();
        let proxies = self.proxy_manager.list_active().await?;

        let outcome = self
            .pool
            .fetch(key, self.admission_timeout(), move || {
                run_adapter_scrape(carrier_id, tracking_code, proxies)
            })
            .await?;

        match outcome {
            PoolOutcome::Admitted(op) => {
                let scrape_result = op.wait_fetched().await;
                op.mark_scraped();

                let persisted = self.persist_scrape(&op.key, scrape_result).await;
                match &persisted {
                    Ok(outcome) => op.finish(Ok(outcome.clone())),
                    Err(err) => op.finish(Err(err.for_waiter())),
                }
                let outcome = persisted?;
                let link = match user {
                    Some(user) => self.store.find_link(user.id, outcome.parcel.id).await?,
                    None => None,
                };
                Ok(TrackResult {
                    parcel: outcome.parcel,
                    snapshot: outcome.snapshot,
                    link,
                    cached: false,
                    outdated: false,
                })
            }
            PoolOutcome::Joined(op) => {
                let outcome = op.wait_done().await?;
                let link = match user {
                    Some(user) => self.store.find_link(user.id, outcome.parcel.id).await?,
                    None => None,
                };
                Ok(TrackResult {
                    parcel: outcome.parcel,
                    snapshot: outcome.snapshot,
                    link,
                    cached: false,
                    outdated: false,
                })
            }
        }
    }

    /// Turns a raw scrape result into a persisted parcel + snapshot,
    /// creating the parcel row the first time this natural key is seen.
    async fn persist_scrape(
        &self,
        key: &ParcelKey,
        scrape_result: std::result::Result<ScrapeOutcome, OpenParcelError>,
    ) -> Result<PersistedOutcome> {
        let scrape_result = scrape_result?;

        let parcel = match self
            .store
            .find_parcel_by_natural_key_any_age(&key.carrier_id, &key.tracking_code)
            .await?
        {
            Some(parcel) => parcel,
            None => {
                self.store
                    .insert_parcel(&key.carrier_id, &key.tracking_code)
                    .await?
            }
        };
        let snapshot = self.store.insert_snapshot(parcel.id, &scrape_result.history).await?;
        Ok(PersistedOutcome { parcel, snapshot })
    }

    /// `POST /register` (spec.md §6): validates username/password shape,
    /// then persists a new user with a PBKDF2 password hash.
    pub async fn register(&self, username: &str, password: &str) -> Result<User> {
        if !crate::auth::is_username_valid(username) {
            return Err(OpenParcelError::not_enough_parameters("username", 422));
        }
        if !crate::auth::is_password_valid(password) {
            return Err(OpenParcelError::not_enough_parameters("password", 422));
        }
        let (salt, hash) = crate::auth::hash_password(password);
        self.store.insert_user(username, &hash, &salt).await
    }

    /// `POST /auth/token/new`: issues a fresh token for an already
    /// password-authenticated user.
    pub async fn issue_auth_token(&self, user: &User, description: &str) -> Result<String> {
        let token = crate::auth::generate_token();
        self.store.insert_auth_token(user.id, &token, description).await?;
        Ok(token)
    }

    pub async fn revoke_auth_token(&self, token: &str) -> Result<()> {
        self.store.revoke_auth_token(token).await
    }

    /// Resolves a `(carrier_id, tracking_code)` or slug pair to a `Parcel`
    /// for the `/save` and `/archive` endpoints, without touching the
    /// scraping pool — these operate on whatever is already persisted.
    pub async fn resolve_parcel_by_natural_key(
        &self,
        carrier_id: &str,
        tracking_code: &str,
    ) -> Result<Parcel> {
        self.store
            .find_parcel_by_natural_key_any_age(carrier_id, tracking_code)
            .await?
            .ok_or(OpenParcelError::ParcelNotFound)
    }

    pub async fn resolve_parcel_by_slug(&self, slug: &str) -> Result<Parcel> {
        if !carriers::is_slug_valid(slug) {
            return Err(OpenParcelError::SlugInvalid);
        }
        self.store
            .find_parcel_by_slug(slug)
            .await?
            .ok_or(OpenParcelError::ParcelNotFound)
    }

    pub async fn save_link(&self, user: &User, parcel: &Parcel, name: &str) -> Result<()> {
        self.store.save_link(user.id, parcel.id, name).await
    }

    pub async fn delete_link(&self, user: &User, parcel: &Parcel) -> Result<()> {
        self.store.delete_link(user.id, parcel.id).await
    }

    pub async fn set_archived(&self, user: &User, parcel: &Parcel, archived: bool) -> Result<()> {
        self.store.set_archived(user.id, parcel.id, archived).await
    }

    /// `GET /parcels`: every parcel the user saved, each with its latest
    /// snapshot (spec.md §8's "most-recent wins" invariant).
    pub async fn list_parcels(&self, user: &User) -> Result<Vec<TrackResult>> {
        let rows = self.store.list_user_parcels(user.id).await?;
        let mut results = Vec::with_capacity(rows.len());
        for (parcel, link) in rows {
            let snapshot = self
                .store
                .latest_snapshot(parcel.id)
                .await?
                .ok_or(OpenParcelError::ParcelNotFound)?;
            let descriptor = self.carrier_descriptor(&parcel.carrier_id)?;
            let outdated = crate::cache::is_outdated(parcel.created, descriptor.outdated_period_days, Utc::now());
            results.push(TrackResult {
                parcel,
                snapshot,
                link: Some(link),
                cached: true,
                outdated,
            });
        }
        Ok(results)
    }
}

/// Runs on the pool's spawned worker task: picks a proxy, launches a
/// driver, runs the carrier adapter, always tears the driver down.
async fn run_adapter_scrape(
    carrier_id: String,
    tracking_code: String,
    proxies: Vec<Proxy>,
) -> Result<ScrapeOutcome> {
    let mut adapter = carriers::make_adapter(&carrier_id, &tracking_code)
        .ok_or(OpenParcelError::CarrierNotFound)?;

    let chosen = pick_proxy(&proxies);
    let proxy_config = chosen.map(|proxy| ProxyConfig {
        scheme: proxy.protocol.as_str().to_string(),
        host: proxy.addr.clone(),
        port: proxy.port,
        username: None,
        password: None,
    });

    let mut driver = ScraperDriver::launch(DriverSettings::default(), proxy_config.as_ref())
        .await
        .map_err(|e| OpenParcelError::ScrapingBrowserError {
            source: anyhow::anyhow!(e.to_string()),
            carrier_context: serde_json::json!({ "carrier": carrier_id }),
        })?;

    let result = adapter.fetch(&mut driver).await;
    driver.close().await;
    result.map(ScrapeOutcome::from)
}

/// Picks a random active proxy, or none if the pool is empty — a direct
/// scrape is a valid fallback, just one more likely to get rate-limited.
fn pick_proxy(proxies: &[Proxy]) -> Option<&Proxy> {
    proxies.choose(&mut rand::thread_rng())
}

/// `history` merged across the scrape + any prior snapshot is already the
/// carrier script's job; this helper exists only to give `bin/server.rs` a
/// single place to reach into a [`TrackResult`]'s scrape payload.
pub fn snapshot_history(result: &TrackResult) -> &Value {
    &result.snapshot.data
}
