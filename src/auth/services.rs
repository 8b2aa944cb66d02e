use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::{
    jwt::TokenKeys,
    password::{hash_password, verify_password},
    repo_types::{creation_time, Attributes, User, CUSTOM, EMAIL, PASSWORD_HASH},
};
use crate::{
    config::AuthConfig,
    error::AuthError,
    store::{Filter, Patch, Store, StoreError, Value},
};

const INVALID_CREDENTIALS: &str = "invalid credentials";
const USER_EXISTS: &str = "user with this email already exists";
const USER_NOT_FOUND: &str = "user not found";

/// Signup, login and account maintenance over one injected [`Store`].
///
/// Holds no per-call state; a single instance is shared by all requests.
pub struct AuthManager {
    config: AuthConfig,
    store: Arc<dyn Store>,
    keys: TokenKeys,
}

/// Maps "no such id" (unknown or unparseable) to the user-facing not-found error.
fn not_found(e: StoreError) -> AuthError {
    match e {
        StoreError::NotFound | StoreError::InvalidId(_) => AuthError::NotFound(USER_NOT_FOUND.into()),
        other => other.into(),
    }
}

impl AuthManager {
    pub fn new(config: AuthConfig, store: Arc<dyn Store>) -> Result<Self, AuthError> {
        let config = config.normalized()?;
        let keys = TokenKeys::new(&config.secret, config.token_expiry_minutes);
        Ok(Self { config, store, keys })
    }

    /// Installs the storage-level uniqueness constraint on email so concurrent
    /// signups cannot both succeed.
    pub async fn prepare(&self) -> Result<(), AuthError> {
        self.store.ensure_unique(&self.config.store_name, EMAIL).await?;
        Ok(())
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn collection(&self) -> &str {
        &self.config.store_name
    }

    #[instrument(skip(self, password, custom))]
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        custom: Attributes,
    ) -> Result<(User, String), AuthError> {
        if email.is_empty() {
            return Err(AuthError::Validation("email is required".into()));
        }
        if password.is_empty() {
            return Err(AuthError::Validation("password is required".into()));
        }

        match self.get_by_email(email).await {
            Ok(_) => {
                warn!(%email, "email already registered");
                return Err(AuthError::Conflict(USER_EXISTS.into()));
            }
            Err(AuthError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut user = User {
            id: String::new(),
            email: email.to_string(),
            password_hash: hash_password(password)?,
            custom,
            created_at: creation_time(),
        };

        user.id = match self.store.create_one(self.collection(), user.to_record()).await {
            Ok(id) => id,
            Err(StoreError::Conflict) => {
                warn!(%email, "email registered concurrently");
                return Err(AuthError::Conflict(USER_EXISTS.into()));
            }
            Err(e) => return Err(e.into()),
        };

        let token = self.keys.sign(&user.id)?;
        info!(user_id = %user.id, %email, "user registered");
        Ok((user, token))
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<(User, String), AuthError> {
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("email and password are required".into()));
        }

        let user = match self.get_by_email(email).await {
            Ok(u) => u,
            Err(AuthError::NotFound(_)) => {
                warn!(%email, "login unknown email");
                return Err(AuthError::Authentication(INVALID_CREDENTIALS.into()));
            }
            Err(e) => return Err(e),
        };

        if !verify_password(&user.password_hash, password) {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::Authentication(INVALID_CREDENTIALS.into()));
        }

        let token = self.keys.sign(&user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok((user, token))
    }

    /// Resolves a token to its subject id.
    pub fn validate_token(&self, token: &str) -> Result<String, AuthError> {
        Ok(self.keys.verify(token)?.sub)
    }

    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: &str) -> Result<User, AuthError> {
        let record = self
            .store
            .find_one(self.collection(), &Filter::by_id(id))
            .await
            .map_err(not_found)?;
        Ok(User::from_record(record)?)
    }

    #[instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> Result<User, AuthError> {
        let record = self
            .store
            .find_one(self.collection(), &Filter::new().eq(EMAIL, email))
            .await
            .map_err(not_found)?;
        Ok(User::from_record(record)?)
    }

    /// Replaces the whole attribute bag and returns the user as re-read from the store.
    #[instrument(skip(self, custom))]
    pub async fn update_profile(&self, id: &str, custom: Attributes) -> Result<User, AuthError> {
        let patch = Patch::new().set(CUSTOM, Value::Json(custom.into()));
        self.store
            .update_one(self.collection(), &Filter::by_id(id), &patch)
            .await
            .map_err(not_found)?;
        info!(user_id = %id, "profile updated");
        self.get_by_id(id).await
    }

    #[instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        if new_password.is_empty() {
            return Err(AuthError::Validation("new password is required".into()));
        }

        let user = self.get_by_id(id).await?;
        if !verify_password(&user.password_hash, old_password) {
            warn!(user_id = %id, "change password with wrong old password");
            return Err(AuthError::Authentication("invalid old password".into()));
        }

        let patch = Patch::new().set(PASSWORD_HASH, hash_password(new_password)?);
        self.store
            .update_one(self.collection(), &Filter::by_id(id), &patch)
            .await
            .map_err(not_found)?;
        info!(user_id = %id, "password changed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&self, id: &str) -> Result<(), AuthError> {
        match self.store.delete_one(self.collection(), &Filter::by_id(id)).await {
            Ok(()) => {
                info!(user_id = %id, "account deleted");
                Ok(())
            }
            Err(StoreError::NotFound | StoreError::InvalidId(_)) => {
                warn!(user_id = %id, "delete for unknown account");
                Err(AuthError::Persistence("failed to delete account".into()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().cloned().unwrap()
    }

    async fn manager() -> AuthManager {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let m = AuthManager::new(AuthConfig::new("test-secret"), store).unwrap();
        m.prepare().await.unwrap();
        m
    }

    #[test]
    fn construction_requires_a_secret() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let err = AuthManager::new(AuthConfig::new(""), store).err().unwrap();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn signup_returns_user_and_token_for_it() {
        let m = manager().await;
        let (user, token) = m
            .signup("a@x.com", "pw", attrs(json!({"bio": "hi"})))
            .await
            .unwrap();
        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.custom, attrs(json!({"bio": "hi"})));
        assert_ne!(user.password_hash, "pw");
        assert_eq!(m.validate_token(&token).unwrap(), user.id);

        let stored = m.get_by_id(&user.id).await.unwrap();
        assert_eq!(stored.created_at, user.created_at);
        assert_eq!(m.get_by_email("a@x.com").await.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn signup_created_at_survives_a_document_round_trip() {
        use crate::store::{mongo, ID_FIELD};

        let m = manager().await;
        let (user, _) = m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();

        let mut doc = mongo::to_document(user.to_record()).unwrap();
        doc.insert("_id", mongodb::bson::oid::ObjectId::new());
        let mut record = mongo::to_record(doc);
        record.insert(ID_FIELD.into(), Value::Text(user.id.clone()));
        let read_back = User::from_record(record).unwrap();

        assert_eq!(read_back.created_at, user.created_at);
        assert_eq!(m.get_by_id(&user.id).await.unwrap().created_at, user.created_at);
    }

    #[tokio::test]
    async fn signup_validates_input() {
        let m = manager().await;
        assert_eq!(
            m.signup("", "pw", Attributes::new()).await.unwrap_err(),
            AuthError::Validation("email is required".into())
        );
        assert_eq!(
            m.signup("a@x.com", "", Attributes::new()).await.unwrap_err(),
            AuthError::Validation("password is required".into())
        );
    }

    #[tokio::test]
    async fn duplicate_signup_conflicts() {
        let m = manager().await;
        m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();
        let err = m.signup("a@x.com", "pw2", Attributes::new()).await.unwrap_err();
        assert_eq!(err, AuthError::Conflict(USER_EXISTS.into()));
    }

    #[tokio::test]
    async fn concurrent_signups_yield_one_account() {
        let m = Arc::new(manager().await);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = m.clone();
                tokio::spawn(async move {
                    m.signup("race@x.com", &format!("pw{i}"), Attributes::new()).await
                })
            })
            .collect();
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e, AuthError::Conflict(USER_EXISTS.into())),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let m = manager().await;
        m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();
        let wrong_pw = m.login("a@x.com", "wrongpw").await.unwrap_err();
        let no_user = m.login("nouser@x.com", "anything").await.unwrap_err();
        assert_eq!(wrong_pw, no_user);
        assert_eq!(wrong_pw.to_string(), "invalid credentials");

        assert!(matches!(
            m.login("", "pw").await.unwrap_err(),
            AuthError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn login_issues_a_token_for_the_account() {
        let m = manager().await;
        let (created, _) = m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();
        let (user, token) = m.login("a@x.com", "pw").await.unwrap();
        assert_eq!(user.id, created.id);
        assert_eq!(m.validate_token(&token).unwrap(), created.id);
    }

    #[tokio::test]
    async fn unknown_or_malformed_ids_are_not_found() {
        let m = manager().await;
        for id in ["nope", "65f1c0ffee0000000000beef"] {
            assert_eq!(
                m.get_by_id(id).await.unwrap_err(),
                AuthError::NotFound(USER_NOT_FOUND.into())
            );
            assert!(matches!(
                m.update_profile(id, Attributes::new()).await.unwrap_err(),
                AuthError::NotFound(_)
            ));
        }
        assert!(matches!(
            m.get_by_email("ghost@x.com").await.unwrap_err(),
            AuthError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn update_profile_replaces_instead_of_merging() {
        let m = manager().await;
        let (user, _) = m
            .signup("a@x.com", "pw", attrs(json!({"name": "A", "age": 3})))
            .await
            .unwrap();
        let updated = m
            .update_profile(&user.id, attrs(json!({"bio": "x"})))
            .await
            .unwrap();
        assert_eq!(updated.custom, attrs(json!({"bio": "x"})));
        assert_eq!(updated.created_at, user.created_at);

        let reread = m.get_by_id(&user.id).await.unwrap();
        assert_eq!(reread.custom, attrs(json!({"bio": "x"})));
    }

    #[tokio::test]
    async fn change_password_swaps_credentials() {
        let m = manager().await;
        let (user, _) = m.signup("a@x.com", "oldpw", Attributes::new()).await.unwrap();

        assert!(matches!(
            m.change_password(&user.id, "not-it", "newpw").await.unwrap_err(),
            AuthError::Authentication(_)
        ));
        assert!(matches!(
            m.change_password(&user.id, "oldpw", "").await.unwrap_err(),
            AuthError::Validation(_)
        ));

        m.change_password(&user.id, "oldpw", "newpw").await.unwrap();
        assert!(matches!(
            m.login("a@x.com", "oldpw").await.unwrap_err(),
            AuthError::Authentication(_)
        ));
        m.login("a@x.com", "newpw").await.unwrap();
    }

    #[tokio::test]
    async fn delete_account_is_permanent() {
        let m = manager().await;
        let (user, _) = m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();
        m.delete_account(&user.id).await.unwrap();
        assert!(matches!(
            m.get_by_id(&user.id).await.unwrap_err(),
            AuthError::NotFound(_)
        ));
        assert_eq!(
            m.delete_account(&user.id).await.unwrap_err(),
            AuthError::Persistence("failed to delete account".into())
        );

        // the email is free again
        m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn custom_store_name_is_used() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut config = AuthConfig::new("s");
        config.store_name = "accounts".into();
        let m = AuthManager::new(config, store.clone()).unwrap();
        m.signup("a@x.com", "pw", Attributes::new()).await.unwrap();
        assert_eq!(store.find_many("accounts", &Filter::new()).await.unwrap().len(), 1);
        assert!(store.find_many("users", &Filter::new()).await.unwrap().is_empty());
    }

    /// Every call fails the same way, as an unreachable or stalled backend would.
    struct DownStore {
        timeout: bool,
    }

    impl DownStore {
        fn fail<T>(&self) -> Result<T, StoreError> {
            Err(if self.timeout {
                StoreError::Timeout
            } else {
                StoreError::Unavailable("connection refused".into())
            })
        }
    }

    #[async_trait::async_trait]
    impl Store for DownStore {
        async fn create_one(&self, _: &str, _: crate::store::Record) -> Result<String, StoreError> {
            self.fail()
        }
        async fn find_one(&self, _: &str, _: &Filter) -> Result<crate::store::Record, StoreError> {
            self.fail()
        }
        async fn find_many(&self, _: &str, _: &Filter) -> Result<Vec<crate::store::Record>, StoreError> {
            self.fail()
        }
        async fn update_one(&self, _: &str, _: &Filter, _: &Patch) -> Result<(), StoreError> {
            self.fail()
        }
        async fn update_many(&self, _: &str, _: &Filter, _: &Patch) -> Result<u64, StoreError> {
            self.fail()
        }
        async fn delete_one(&self, _: &str, _: &Filter) -> Result<(), StoreError> {
            self.fail()
        }
        async fn delete_many(&self, _: &str, _: &Filter) -> Result<u64, StoreError> {
            self.fail()
        }
        async fn ensure_unique(&self, _: &str, _: &str) -> Result<(), StoreError> {
            self.fail()
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.fail()
        }
    }

    async fn assert_every_call_fails_with(timeout: bool, expected: AuthError) {
        let store: Arc<dyn Store> = Arc::new(DownStore { timeout });
        let m = AuthManager::new(AuthConfig::new("s"), store).unwrap();
        let id = "65f1c0ffee0000000000beef";

        assert_eq!(m.prepare().await.unwrap_err(), expected);
        // the pre-check must not read as "no such user" and go on to create
        assert_eq!(
            m.signup("a@x.com", "pw", Attributes::new()).await.unwrap_err(),
            expected
        );
        // nor must a failed lookup read as bad credentials
        assert_eq!(m.login("a@x.com", "pw").await.unwrap_err(), expected);
        assert_eq!(m.get_by_id(id).await.unwrap_err(), expected);
        assert_eq!(m.get_by_email("a@x.com").await.unwrap_err(), expected);
        assert_eq!(
            m.update_profile(id, Attributes::new()).await.unwrap_err(),
            expected
        );
        assert_eq!(m.change_password(id, "old", "new").await.unwrap_err(), expected);
        assert_eq!(m.delete_account(id).await.unwrap_err(), expected);
    }

    #[tokio::test]
    async fn store_timeouts_propagate_unchanged() {
        assert_every_call_fails_with(true, AuthError::StoreTimeout).await;
    }

    #[tokio::test]
    async fn store_outages_propagate_unchanged() {
        assert_every_call_fails_with(false, AuthError::StoreUnavailable).await;
    }
}
