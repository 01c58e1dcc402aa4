//! Access to the `signage_applications` table behind the managed backend's
//! REST interface, plus an in-process store for tests and offline use.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};

use crate::config::Config;
use crate::error::{CoreResult, KasaError};
use crate::http_client::HttpClient;
use crate::model::{ApplicationStatus, NewApplication, SignageApplication, StatusPatch};

const TABLE: &str = "signage_applications";

/// Fee applied to a new application until the datastore says otherwise.
/// The REST store relies on the table default instead.
const DEFAULT_AMOUNT_DUE: f64 = 50_000.0;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new application and return the stored row.
    async fn insert(&self, app: NewApplication) -> CoreResult<SignageApplication>;

    /// Look up one application by its shareable id.
    async fn find(&self, application_id: &str) -> CoreResult<Option<SignageApplication>>;

    /// All applications, newest first, optionally filtered by status.
    async fn list(&self, status: Option<ApplicationStatus>) -> CoreResult<Vec<SignageApplication>>;

    /// Apply a status transition patch to the row with the given primary key.
    async fn update_status(&self, id: &str, patch: StatusPatch) -> CoreResult<SignageApplication>;
}

/// PostgREST-style store over the shared HTTP client.
#[derive(Debug, Clone)]
pub struct RestStore {
    http: HttpClient,
    base: String,
    api_key: SecretString,
}

impl RestStore {
    pub fn new(http: HttpClient, base: String, api_key: SecretString) -> Self {
        Self { http, base, api_key }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Ok(Self::new(
            HttpClient::from_cfg(&cfg.http)?,
            cfg.rest_url(TABLE),
            cfg.supabase.service_key()?,
        ))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            HttpClient::new_default().unwrap(),
            format!("{server_base}/rest/v1/{TABLE}"),
            SecretString::new("test-key".into()),
        )
    }

    /// Filter values go through the URL's query serializer, so an id taken
    /// from user input cannot smuggle extra query parameters into the filter.
    fn table_url(&self, pairs: &[(&str, &str)]) -> CoreResult<String> {
        let mut url =
            reqwest::Url::parse(&self.base).map_err(|e| KasaError::Other(e.into()))?;
        url.query_pairs_mut().extend_pairs(pairs);
        Ok(url.into())
    }

    fn headers<'a>(&self, auth: &'a str, key: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("apikey", key),
            ("Authorization", auth),
            ("Content-Type", "application/json"),
            // Writes come back as the stored representation.
            ("Prefer", "return=representation"),
        ]
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn insert(&self, app: NewApplication) -> CoreResult<SignageApplication> {
        let key = self.api_key.expose_secret().to_string();
        let auth = format!("Bearer {key}");
        let rows: Vec<SignageApplication> = self
            .http
            .post_json(&self.base, &app, &self.headers(&auth, &key))
            .await?;
        rows.into_iter().next().ok_or_else(|| KasaError::StoreError {
            code: "empty".into(),
            message: "insert returned no representation".into(),
        })
    }

    async fn find(&self, application_id: &str) -> CoreResult<Option<SignageApplication>> {
        let key = self.api_key.expose_secret().to_string();
        let auth = format!("Bearer {key}");
        let url = self.table_url(&[
            ("select", "*"),
            ("application_id", &format!("eq.{application_id}")),
        ])?;
        let rows: Vec<SignageApplication> = self
            .http
            .get_json(&url, &self.headers(&auth, &key))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list(&self, status: Option<ApplicationStatus>) -> CoreResult<Vec<SignageApplication>> {
        let key = self.api_key.expose_secret().to_string();
        let auth = format!("Bearer {key}");
        let mut pairs = vec![
            ("select", "*".to_string()),
            ("order", "created_at.desc".to_string()),
        ];
        if let Some(status) = status {
            // serde gives us the stored snake_case token.
            let token = serde_json::to_string(&status)
                .map_err(|e| KasaError::Other(e.into()))?
                .trim_matches('"')
                .to_string();
            pairs.push(("status", format!("eq.{token}")));
        }
        let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let url = self.table_url(&pairs)?;
        self.http.get_json(&url, &self.headers(&auth, &key)).await
    }

    async fn update_status(&self, id: &str, patch: StatusPatch) -> CoreResult<SignageApplication> {
        let key = self.api_key.expose_secret().to_string();
        let auth = format!("Bearer {key}");
        let url = self.table_url(&[("id", &format!("eq.{id}"))])?;
        let rows: Vec<SignageApplication> = self
            .http
            .patch_json(&url, &patch, &self.headers(&auth, &key))
            .await?;
        rows.into_iter().next().ok_or_else(|| KasaError::NotFound {
            application_id: id.to_string(),
        })
    }
}

/// In-process store used by tests and by the CLI when no datastore is
/// configured. Plays the role the null provider plays for chat.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<SignageApplication>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, app: NewApplication) -> CoreResult<SignageApplication> {
        let mut rows = self.rows.lock().expect("store lock");
        if rows.iter().any(|r| r.application_id == app.application_id) {
            return Err(KasaError::StoreError {
                code: "conflict".into(),
                message: format!("application_id {} already exists", app.application_id),
            });
        }
        let row = SignageApplication {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: app.application_id,
            business_name: app.business_name,
            email: app.email,
            phone: app.phone,
            signage_type: app.signage_type,
            location: app.location,
            description: app.description,
            status: ApplicationStatus::PendingPayment,
            amount_due: DEFAULT_AMOUNT_DUE,
            amount_paid: 0.0,
            payment_date: None,
            issued_date: None,
            expiry_date: None,
            created_at: Utc::now(),
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn find(&self, application_id: &str) -> CoreResult<Option<SignageApplication>> {
        let rows = self.rows.lock().expect("store lock");
        Ok(rows
            .iter()
            .find(|r| r.application_id == application_id)
            .cloned())
    }

    async fn list(&self, status: Option<ApplicationStatus>) -> CoreResult<Vec<SignageApplication>> {
        let rows = self.rows.lock().expect("store lock");
        let mut out: Vec<_> = rows
            .iter()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn update_status(&self, id: &str, patch: StatusPatch) -> CoreResult<SignageApplication> {
        let mut rows = self.rows.lock().expect("store lock");
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| KasaError::NotFound {
                application_id: id.to_string(),
            })?;
        row.status = patch.status;
        if let Some(v) = patch.amount_paid {
            row.amount_paid = v;
        }
        if let Some(v) = patch.payment_date {
            row.payment_date = Some(v);
        }
        if let Some(v) = patch.issued_date {
            row.issued_date = Some(v);
        }
        if let Some(v) = patch.expiry_date {
            row.expiry_date = Some(v);
        }
        Ok(row.clone())
    }
}
