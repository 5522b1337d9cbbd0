//! Access-token acquisition for a tenant mailbox.
//!
//! Each stage runs at most once per cycle, in order: the stored access token,
//! a refresh-token exchange, then an application (client-credentials) grant.

use std::fmt::{Display, Formatter};

use tracing::{debug, info, warn};

use crate::config::ProviderSettings;
use crate::db::models::Tenant;
use crate::db::Database;
use crate::error::PipelineError;
use crate::provider::{AppCredentials, MailProvider, ProviderError, TokenGrant};

pub mod seal;

pub use seal::{SealError, TokenSeal};

/// Stored refresh-token values that mean "no delegated consent".
const PLACEHOLDER_REFRESH_TOKENS: &[&str] = &["placeholder", "null", "none", "undefined", "app-only"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CurrentToken,
    RefreshToken,
    ClientCredentials,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [
        Stage::CurrentToken,
        Stage::RefreshToken,
        Stage::ClientCredentials,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentToken => "current_token",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Granted(AccessToken),
    /// This stage cannot produce a token; try the next one.
    Next(String),
    /// Stop the chain without deactivating the tenant.
    Fatal(String),
}

pub fn is_placeholder_refresh_token(raw: Option<&str>) -> bool {
    match raw.map(str::trim) {
        None | Some("") => true,
        Some(value) => PLACEHOLDER_REFRESH_TOKENS
            .iter()
            .any(|placeholder| value.eq_ignore_ascii_case(placeholder)),
    }
}

/// Tenant-level app registration overrides win over the global settings.
pub fn app_credentials_for(tenant: &Tenant, settings: &ProviderSettings) -> Option<AppCredentials> {
    let directory_tenant_id = tenant
        .config_str("directory_tenant_id")
        .or_else(|| settings.directory_tenant_id.clone())?;
    let client_id = tenant
        .config_str("client_id")
        .or_else(|| settings.client_id.clone())?;
    let client_secret = tenant
        .config_str("client_secret")
        .or_else(|| settings.client_secret.clone())?;
    Some(AppCredentials {
        directory_tenant_id,
        client_id,
        client_secret,
    })
}

pub struct CredentialManager<'a> {
    db: &'a Database,
    provider: &'a dyn MailProvider,
    settings: &'a ProviderSettings,
    seal: Option<&'a TokenSeal>,
}

impl<'a> CredentialManager<'a> {
    pub fn new(
        db: &'a Database,
        provider: &'a dyn MailProvider,
        settings: &'a ProviderSettings,
        seal: Option<&'a TokenSeal>,
    ) -> Self {
        Self {
            db,
            provider,
            settings,
            seal,
        }
    }

    pub async fn ensure_valid_token(&self, tenant: &Tenant) -> Result<AccessToken, PipelineError> {
        let mut reasons = Vec::new();

        for stage in Stage::ORDER {
            match self.run_stage(stage, tenant).await? {
                StageOutcome::Granted(token) => {
                    debug!(tenant_id = %tenant.tenant_id, %stage, "access token ready");
                    return Ok(token);
                }
                StageOutcome::Next(reason) => {
                    debug!(tenant_id = %tenant.tenant_id, %stage, reason, "credential stage fell through");
                    reasons.push(format!("{stage}: {reason}"));
                }
                StageOutcome::Fatal(reason) => {
                    warn!(tenant_id = %tenant.tenant_id, %stage, reason, "credential chain interrupted");
                    return Err(PipelineError::ProviderUnavailable(reason));
                }
            }
        }

        warn!(
            tenant_id = %tenant.tenant_id,
            reasons = %reasons.join("; "),
            "all credential stages failed; deactivating tenant"
        );
        self.db.set_tenant_active(&tenant.tenant_id, false)?;
        Err(PipelineError::AuthExpired {
            tenant_id: tenant.tenant_id.clone(),
        })
    }

    pub async fn run_stage(
        &self,
        stage: Stage,
        tenant: &Tenant,
    ) -> Result<StageOutcome, PipelineError> {
        match stage {
            Stage::CurrentToken => Ok(self.try_current_token(tenant).await),
            Stage::RefreshToken => self.try_refresh_token(tenant).await,
            Stage::ClientCredentials => self.try_client_credentials(tenant).await,
        }
    }

    async fn try_current_token(&self, tenant: &Tenant) -> StageOutcome {
        let Some(access_token) = self.reveal(tenant.access_token.as_deref()) else {
            return StageOutcome::Next("no stored access token".to_string());
        };

        match self
            .provider
            .check_access(&tenant.mailbox_address, &access_token)
            .await
        {
            Ok(()) => StageOutcome::Granted(AccessToken {
                value: access_token,
                stage: Stage::CurrentToken,
            }),
            Err(error) => outcome_for_error(error),
        }
    }

    async fn try_refresh_token(&self, tenant: &Tenant) -> Result<StageOutcome, PipelineError> {
        let refresh_token = self.reveal(tenant.refresh_token.as_deref());
        if is_placeholder_refresh_token(refresh_token.as_deref()) {
            return Ok(StageOutcome::Next(
                "refresh token empty or placeholder".to_string(),
            ));
        }
        let Some(refresh_token) = refresh_token else {
            return Ok(StageOutcome::Next("no refresh token".to_string()));
        };
        let Some(app) = app_credentials_for(tenant, self.settings) else {
            return Ok(StageOutcome::Next("no app registration configured".to_string()));
        };

        match self.provider.refresh_token_grant(&app, &refresh_token).await {
            Ok(grant) => {
                self.persist(tenant, &grant)?;
                info!(tenant_id = %tenant.tenant_id, "refreshed delegated access token");
                Ok(StageOutcome::Granted(AccessToken {
                    value: grant.access_token,
                    stage: Stage::RefreshToken,
                }))
            }
            Err(error) => Ok(outcome_for_error(error)),
        }
    }

    async fn try_client_credentials(&self, tenant: &Tenant) -> Result<StageOutcome, PipelineError> {
        let Some(app) = app_credentials_for(tenant, self.settings) else {
            return Ok(StageOutcome::Next("no app registration configured".to_string()));
        };

        match self.provider.client_credentials_grant(&app).await {
            Ok(grant) => {
                self.persist(tenant, &grant)?;
                info!(tenant_id = %tenant.tenant_id, "obtained application access token");
                Ok(StageOutcome::Granted(AccessToken {
                    value: grant.access_token,
                    stage: Stage::ClientCredentials,
                }))
            }
            Err(error) => Ok(outcome_for_error(error)),
        }
    }

    fn persist(&self, tenant: &Tenant, grant: &TokenGrant) -> Result<(), PipelineError> {
        let access = self.conceal(&grant.access_token);
        let refresh = grant
            .refresh_token
            .as_deref()
            .map(|token| self.conceal(token));
        self.db
            .update_tenant_tokens(&tenant.tenant_id, &access, refresh.as_deref())?;
        Ok(())
    }

    fn reveal(&self, stored: Option<&str>) -> Option<String> {
        let stored = stored.map(str::trim).filter(|value| !value.is_empty())?;
        match self.seal {
            Some(seal) => match seal.open(stored) {
                Ok(value) => Some(value),
                Err(error) => {
                    warn!(%error, "stored token could not be unsealed; ignoring it");
                    None
                }
            },
            None if seal::is_sealed(stored) => {
                warn!("stored token is sealed but ARS_TOKEN_KEY is not set; ignoring it");
                None
            }
            None => Some(stored.to_string()),
        }
    }

    fn conceal(&self, token: &str) -> String {
        match self.seal {
            Some(seal) => match seal.seal(token) {
                Ok(sealed) => sealed,
                Err(error) => {
                    warn!(%error, "token sealing failed; storing plaintext");
                    token.to_string()
                }
            },
            None => token.to_string(),
        }
    }
}

fn outcome_for_error(error: ProviderError) -> StageOutcome {
    match error {
        ProviderError::Unauthorized(reason) | ProviderError::Invalid(reason) => {
            StageOutcome::Next(reason)
        }
        ProviderError::Unavailable(reason) | ProviderError::RateLimited(reason) => {
            StageOutcome::Fatal(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::{
        app_credentials_for, is_placeholder_refresh_token, CredentialManager, Stage, TokenSeal,
    };
    use crate::config::ProviderSettings;
    use crate::db::models::{InboundMessage, Tenant};
    use crate::db::Database;
    use crate::error::PipelineError;
    use crate::provider::{AppCredentials, MailProvider, OutboundReply, ProviderError, TokenGrant};

    struct ScriptedProvider {
        access_check: Result<(), ProviderError>,
        refresh: Result<TokenGrant, ProviderError>,
        client: Result<TokenGrant, ProviderError>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                access_check: Err(ProviderError::Unauthorized("expired".to_string())),
                refresh: Err(ProviderError::Unauthorized("invalid_grant".to_string())),
                client: Err(ProviderError::Unauthorized("invalid_client".to_string())),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    fn grant(access: &str, refresh: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[async_trait(?Send)]
    impl MailProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn check_access(&self, _mailbox: &str, token: &str) -> Result<(), ProviderError> {
            self.calls.borrow_mut().push(format!("check:{token}"));
            self.access_check.clone()
        }

        async fn refresh_token_grant(
            &self,
            _app: &AppCredentials,
            refresh_token: &str,
        ) -> Result<TokenGrant, ProviderError> {
            self.calls.borrow_mut().push(format!("refresh:{refresh_token}"));
            self.refresh.clone()
        }

        async fn client_credentials_grant(
            &self,
            _app: &AppCredentials,
        ) -> Result<TokenGrant, ProviderError> {
            self.calls.borrow_mut().push("client".to_string());
            self.client.clone()
        }

        async fn list_messages_since(
            &self,
            _mailbox: &str,
            _token: &str,
            _since: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<InboundMessage>, ProviderError> {
            Ok(Vec::new())
        }

        async fn send_reply(
            &self,
            _mailbox: &str,
            _token: &str,
            _reply: &OutboundReply,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ars-credentials-test-{}.db", Uuid::new_v4()));
        path
    }

    fn settings() -> ProviderSettings {
        ProviderSettings {
            directory_tenant_id: Some("dir-1".to_string()),
            client_id: Some("client-a".to_string()),
            client_secret: Some("secret-a".to_string()),
            ..ProviderSettings::default()
        }
    }

    fn seeded_db(access: Option<&str>, refresh: Option<&str>) -> (PathBuf, Database, Tenant) {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let mut tenant = Tenant::new("t-1", "office@example.edu");
        tenant.access_token = access.map(str::to_string);
        tenant.refresh_token = refresh.map(str::to_string);
        db.upsert_tenant(&tenant).expect("insert tenant");
        (path, db, tenant)
    }

    #[test]
    fn placeholder_refresh_tokens_are_detected() {
        assert!(is_placeholder_refresh_token(None));
        assert!(is_placeholder_refresh_token(Some("  ")));
        assert!(is_placeholder_refresh_token(Some("App-Only")));
        assert!(is_placeholder_refresh_token(Some("null")));
        assert!(!is_placeholder_refresh_token(Some("0.AXoA-real-token")));
    }

    #[test]
    fn tenant_app_registration_overrides_globals() {
        let mut tenant = Tenant::new("t-1", "office@example.edu");
        tenant.config = Some(json!({ "client_id": "tenant-client" }));
        let app = app_credentials_for(&tenant, &settings()).expect("credentials");
        assert_eq!(app.client_id, "tenant-client");
        assert_eq!(app.client_secret, "secret-a");

        assert!(app_credentials_for(&tenant, &ProviderSettings::default()).is_none());
    }

    #[tokio::test]
    async fn valid_current_token_needs_no_grant() {
        let (path, db, tenant) = seeded_db(Some("access-1"), Some("refresh-1"));
        let mut provider = ScriptedProvider::new();
        provider.access_check = Ok(());
        let settings = settings();

        let token = CredentialManager::new(&db, &provider, &settings, None)
            .ensure_valid_token(&tenant)
            .await
            .expect("token");
        assert_eq!(token.value, "access-1");
        assert_eq!(token.stage, Stage::CurrentToken);
        assert_eq!(provider.calls(), vec!["check:access-1"]);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let (path, db, tenant) = seeded_db(Some("access-1"), Some("refresh-1"));
        let mut provider = ScriptedProvider::new();
        provider.refresh = Ok(grant("access-2", Some("refresh-2")));
        let settings = settings();

        let token = CredentialManager::new(&db, &provider, &settings, None)
            .ensure_valid_token(&tenant)
            .await
            .expect("token");
        assert_eq!(token.stage, Stage::RefreshToken);

        let stored = db.get_tenant("t-1").expect("get").expect("exists");
        assert_eq!(stored.access_token.as_deref(), Some("access-2"));
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn empty_refresh_token_goes_straight_to_client_credentials() {
        let (path, db, tenant) = seeded_db(Some("access-1"), Some(""));
        let mut provider = ScriptedProvider::new();
        provider.client = Ok(grant("app-token", None));
        let settings = settings();

        let token = CredentialManager::new(&db, &provider, &settings, None)
            .ensure_valid_token(&tenant)
            .await
            .expect("token");
        assert_eq!(token.value, "app-token");
        assert_eq!(token.stage, Stage::ClientCredentials);
        assert!(provider.calls().iter().all(|call| !call.starts_with("refresh")));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn exhausted_chain_deactivates_tenant() {
        let (path, db, tenant) = seeded_db(Some("access-1"), Some("refresh-1"));
        let provider = ScriptedProvider::new();
        let settings = settings();

        let error = CredentialManager::new(&db, &provider, &settings, None)
            .ensure_valid_token(&tenant)
            .await
            .expect_err("auth expired");
        assert!(matches!(error, PipelineError::AuthExpired { .. }));
        assert_eq!(
            provider.calls(),
            vec!["check:access-1", "refresh:refresh-1", "client"]
        );
        assert!(!db.get_tenant("t-1").expect("get").expect("exists").active);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn provider_outage_keeps_tenant_active() {
        let (path, db, tenant) = seeded_db(Some("access-1"), Some("refresh-1"));
        let mut provider = ScriptedProvider::new();
        provider.access_check = Err(ProviderError::Unavailable("503".to_string()));
        let settings = settings();

        let error = CredentialManager::new(&db, &provider, &settings, None)
            .ensure_valid_token(&tenant)
            .await
            .expect_err("unavailable");
        assert!(matches!(error, PipelineError::ProviderUnavailable(_)));
        assert_eq!(provider.calls().len(), 1);
        assert!(db.get_tenant("t-1").expect("get").expect("exists").active);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn granted_tokens_are_sealed_at_rest() {
        let (path, db, tenant) = seeded_db(None, Some("refresh-1"));
        let mut provider = ScriptedProvider::new();
        provider.refresh = Ok(grant("access-2", Some("refresh-2")));
        let settings = settings();
        let seal = TokenSeal::from_key(&[9u8; 32]).expect("seal");

        CredentialManager::new(&db, &provider, &settings, Some(&seal))
            .ensure_valid_token(&tenant)
            .await
            .expect("token");

        let stored = db.get_tenant("t-1").expect("get").expect("exists");
        let sealed_access = stored.access_token.expect("access stored");
        assert_ne!(sealed_access, "access-2");
        assert_eq!(seal.open(&sealed_access).expect("open"), "access-2");
        let _ = std::fs::remove_file(path);
    }
}
