use crate::{
    clock::Clock,
    error::{Denial, Error, Invalid, Result},
    models::{ApprovalStatus, Member, NewUser, Role, User, UserPatch},
    session::{Session, SessionStore},
    store::EntityStore,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use serde::Deserialize;
use std::{fmt, sync::Arc};
use tracing::{info, warn};
use validator::Validate;

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub usn: String,
    #[validate(length(min = 1))]
    pub phone: String,
    #[validate(length(min = 6))]
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Authentication and role gating. Every page-level entry point starts with
/// [`Access::require_role`] and works with the account it hands back.
#[derive(Clone)]
pub struct Access {
    store: Arc<dyn EntityStore>,
    sessions: SessionStore,
    clock: Arc<dyn Clock>,
    hash_params: Params,
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Access")
            .field("sessions", &self.sessions)
            .field("clock", &self.clock)
            .field("hash_params", &self.hash_params)
            .finish_non_exhaustive()
    }
}

impl Access {
    pub fn new(store: Arc<dyn EntityStore>, sessions: SessionStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sessions,
            clock,
            hash_params: Params::default(),
        }
    }

    /// Argon2id cost parameters for new password hashes.
    pub fn with_hash_params(mut self, params: Params) -> Self {
        self.hash_params = params;
        self
    }

    /// Self-registration always yields a pending student.
    pub async fn register(&self, form: Registration) -> Result<User> {
        let form = Registration {
            name: form.name.trim().to_string(),
            email: normalize_email(&form.email),
            usn: form.usn.trim().to_uppercase(),
            phone: form.phone.trim().to_string(),
            ..form
        };
        form.validate()?;

        if form.password != form.confirm_password {
            return Err(Invalid::PasswordMismatch.into());
        }
        if !is_valid_phone(&form.phone) {
            return Err(Invalid::MalformedPhone.into());
        }
        if !is_valid_usn(&form.usn) {
            return Err(Invalid::MalformedUsn.into());
        }

        let user = self
            .store
            .create_user(NewUser {
                name: form.name,
                email: form.email,
                usn: form.usn,
                phone: form.phone,
                password_hash: self.hash_password(&form.password)?,
                role: Role::Student,
                approval_status: ApprovalStatus::Pending,
            })
            .await?;

        info!(user_id = %user.id, usn = %user.usn, "registered member awaiting approval");
        Ok(user)
    }

    /// Creates an approved admin unless the email is already in use.
    pub async fn seed_admin(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Option<User>> {
        let email = normalize_email(email);
        if self.store.find_user_by_email(&email).await?.is_some() {
            return Ok(None);
        }
        // emails are unique, so every seeded admin gets a distinct usn
        let usn = format!("ADMIN-{}", email.to_uppercase());

        let user = self
            .store
            .create_user(NewUser {
                name: name.to_string(),
                email,
                usn,
                phone: "0000000000".to_string(),
                password_hash: self.hash_password(password)?,
                role: Role::Admin,
                approval_status: ApprovalStatus::Approved,
            })
            .await?;

        info!(user_id = %user.id, "seeded administrator account");
        Ok(Some(user))
    }

    /// Pending accounts may sign in; [`Access::require_role`] still blocks them.
    pub async fn login(&self, email: &str, password: &str) -> Result<(Session, User)> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(Denial::BadCredentials.into());
        }

        let Some(user) = self.store.find_user_by_email(&email).await? else {
            warn!("login attempt for unknown email");
            return Err(Denial::BadCredentials.into());
        };
        if !self.verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "login attempt with wrong password");
            return Err(Denial::BadCredentials.into());
        }

        let session = self.sessions.open(&user.id, self.clock.now())?;
        info!(user_id = %user.id, role = %user.role, "signed in");
        Ok((session, user))
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        self.sessions.close(token)?;
        Ok(())
    }

    /// The account behind a live session, whatever its role or approval.
    pub async fn authenticate(&self, token: &str) -> Result<User> {
        let Some(user_id) = self.sessions.resolve(token, self.clock.now())? else {
            return Err(Denial::NoSession.into());
        };

        match self.store.get_user(&user_id).await {
            Ok(user) => Ok(user),
            Err(crate::store::StoreError::NotFound { .. }) => {
                warn!(user_id = %user_id, "session outlived its account, signing out");
                self.sessions.close(token)?;
                Err(Denial::UnknownUser.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Approved account of any role.
    pub async fn require_member(&self, token: &str) -> Result<User> {
        let user = self.authenticate(token).await?;
        if !user.is_approved() {
            warn!(user_id = %user.id, "blocked pending account");
            return Err(Denial::PendingApproval.into());
        }
        Ok(user)
    }

    pub async fn require_role(&self, token: &str, expected: Role) -> Result<User> {
        let user = self.require_member(token).await?;
        if user.role != expected {
            warn!(user_id = %user.id, role = %user.role, expected = %expected, "access denied");
            return Err(Denial::WrongRole { actual: user.role }.into());
        }
        Ok(user)
    }

    pub async fn update_profile(&self, token: &str, update: ProfileUpdate) -> Result<User> {
        let user = self.require_member(token).await?;

        let name = match update.name.map(|name| name.trim().to_string()) {
            Some(name) if name.is_empty() => return Err(Error::field("name")),
            other => other,
        };
        let phone = match update.phone.map(|phone| phone.trim().to_string()) {
            Some(phone) if !is_valid_phone(&phone) => return Err(Invalid::MalformedPhone.into()),
            other => other,
        };

        let patch = UserPatch {
            name,
            phone,
            ..UserPatch::default()
        };
        Ok(self.store.update_user(&user.id, patch).await?)
    }

    pub async fn change_password(
        &self,
        token: &str,
        current: &str,
        new: &str,
        confirm: &str,
    ) -> Result<()> {
        let user = self.require_member(token).await?;
        if !self.verify_password(current, &user.password_hash) {
            return Err(Denial::BadCredentials.into());
        }
        check_new_password(new, confirm)?;

        let patch = UserPatch {
            password_hash: Some(self.hash_password(new)?),
            ..UserPatch::default()
        };
        self.store.update_user(&user.id, patch).await?;
        info!(user_id = %user.id, "password changed");
        Ok(())
    }

    /// Resets a password for whoever knows the matching email and USN, then
    /// ends every session of that account.
    pub async fn reset_password(
        &self,
        email: &str,
        usn: &str,
        new: &str,
        confirm: &str,
    ) -> Result<()> {
        let email = normalize_email(email);
        let usn = usn.trim().to_uppercase();
        check_new_password(new, confirm)?;

        let user = match self.store.find_user_by_email(&email).await? {
            Some(user) if user.usn.eq_ignore_ascii_case(&usn) => user,
            _ => return Err(Invalid::NoMatchingAccount.into()),
        };

        let patch = UserPatch {
            password_hash: Some(self.hash_password(new)?),
            ..UserPatch::default()
        };
        self.store.update_user(&user.id, patch).await?;
        self.sessions.close_all_for(&user.id)?;
        info!(user_id = %user.id, "password reset");
        Ok(())
    }

    pub async fn list_members(&self, pending_only: bool) -> Result<Vec<Member>> {
        let users = self.store.list_users().await?;
        Ok(users
            .iter()
            .filter(|user| !pending_only || !user.is_approved())
            .map(Member::from)
            .collect())
    }

    pub async fn approve_member(&self, user_id: &str) -> Result<Member> {
        let patch = UserPatch {
            approval_status: Some(ApprovalStatus::Approved),
            ..UserPatch::default()
        };
        let user = self.store.update_user(user_id, patch).await?;
        info!(user_id = %user.id, "member approved");
        Ok(Member::from(&user))
    }

    pub async fn set_role(&self, user_id: &str, role: Role) -> Result<Member> {
        let patch = UserPatch {
            role: Some(role),
            ..UserPatch::default()
        };
        let user = self.store.update_user(user_id, patch).await?;
        info!(user_id = %user.id, role = %role, "member role changed");
        Ok(Member::from(&user))
    }

    fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        self.hasher()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| Error::Credential(err.to_string()))
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.hash_params.clone())
    }

    fn verify_password(&self, password: &str, stored: &str) -> bool {
        PasswordHash::new(stored)
            .map(|parsed| {
                self.hasher()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn check_new_password(new: &str, confirm: &str) -> Result<()> {
    if new.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::field("password"));
    }
    if new != confirm {
        return Err(Invalid::PasswordMismatch.into());
    }
    Ok(())
}

pub fn is_valid_phone(phone: &str) -> bool {
    phone.len() == 10 && phone.bytes().all(|b| b.is_ascii_digit())
}

/// `1CK` + two digits + two capital letters + three digits, e.g. `1CK23EC001`.
pub fn is_valid_usn(usn: &str) -> bool {
    let bytes = usn.as_bytes();
    bytes.len() == 10
        && bytes.starts_with(b"1CK")
        && bytes[3..5].iter().all(u8::is_ascii_digit)
        && bytes[5..7].iter().all(u8::is_ascii_uppercase)
        && bytes[7..10].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{clock::ManualClock, local_store::LocalStore};
    use chrono::{Duration, Utc};

    struct Fixture {
        access: Access,
        store: Arc<LocalStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::new());
        let clock = ManualClock::new(Utc::now());
        let access = Access::new(store.clone(), SessionStore::default(), Arc::new(clock.clone()))
            .with_hash_params(Params::new(8, 1, 1, None).unwrap());
        Fixture {
            access,
            store,
            clock,
        }
    }

    fn registration(email: &str, usn: &str) -> Registration {
        Registration {
            name: "Asha Rao".to_string(),
            email: email.to_string(),
            usn: usn.to_string(),
            phone: "9876543210".to_string(),
            password: "secret1".to_string(),
            confirm_password: "secret1".to_string(),
        }
    }

    async fn approved_student(fx: &Fixture, email: &str, usn: &str) -> User {
        let user = fx.access.register(registration(email, usn)).await.unwrap();
        fx.access.approve_member(&user.id).await.unwrap();
        user
    }

    #[actix_web::test]
    async fn test_register_defaults() {
        let fx = fixture();
        let user = fx
            .access
            .register(registration(" Asha@Example.com ", "1ck23ec001"))
            .await
            .unwrap();

        assert_eq!(user.role, Role::Student);
        assert_eq!(user.approval_status, ApprovalStatus::Pending);
        assert_eq!(user.usn, "1CK23EC001");
        assert_eq!(user.email, "asha@example.com");
        assert_ne!(user.password_hash, "secret1");
    }

    #[actix_web::test]
    async fn test_register_validation() {
        let fx = fixture();

        let mut form = registration("asha@example.com", "1CK23EC001");
        form.confirm_password = "secret2".to_string();
        assert!(matches!(
            fx.access.register(form).await,
            Err(Error::ValidationFailed(Invalid::PasswordMismatch))
        ));

        let form = registration("asha@example.com", "2CK23EC001");
        assert!(matches!(
            fx.access.register(form).await,
            Err(Error::ValidationFailed(Invalid::MalformedUsn))
        ));

        let mut form = registration("asha@example.com", "1CK23EC001");
        form.phone = "98765".to_string();
        assert!(matches!(
            fx.access.register(form).await,
            Err(Error::ValidationFailed(Invalid::MalformedPhone))
        ));

        let form = registration("not-an-email", "1CK23EC001");
        assert!(matches!(
            fx.access.register(form).await,
            Err(Error::ValidationFailed(Invalid::Field(field))) if field == "email"
        ));

        let mut form = registration("asha@example.com", "1CK23EC001");
        form.name = "   ".to_string();
        assert!(matches!(
            fx.access.register(form).await,
            Err(Error::ValidationFailed(Invalid::Field(field))) if field == "name"
        ));

        assert!(fx.store.list_users().await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_register_duplicates() {
        let fx = fixture();
        fx.access
            .register(registration("asha@example.com", "1CK23EC001"))
            .await
            .unwrap();

        assert!(matches!(
            fx.access
                .register(registration("ASHA@example.com", "1CK23EC002"))
                .await,
            Err(Error::ValidationFailed(Invalid::EmailTaken))
        ));
        assert!(matches!(
            fx.access
                .register(registration("ravi@example.com", "1CK23EC001"))
                .await,
            Err(Error::ValidationFailed(Invalid::UsnTaken))
        ));
    }

    #[actix_web::test]
    async fn test_login_and_logout() {
        let fx = fixture();
        let user = approved_student(&fx, "asha@example.com", "1CK23EC001").await;

        assert!(matches!(
            fx.access.login("asha@example.com", "wrong-pass").await,
            Err(Error::Unauthorized(Denial::BadCredentials))
        ));
        assert!(matches!(
            fx.access.login("nobody@example.com", "secret1").await,
            Err(Error::Unauthorized(Denial::BadCredentials))
        ));

        let (session, signed_in) = fx.access.login("asha@example.com", "secret1").await.unwrap();
        assert_eq!(session.user_id, user.id);
        assert_eq!(signed_in.id, user.id);

        let resolved = fx
            .access
            .require_role(&session.token, Role::Student)
            .await
            .unwrap();
        assert_eq!(resolved.id, user.id);

        fx.access.logout(&session.token).unwrap();
        assert!(matches!(
            fx.access.require_role(&session.token, Role::Student).await,
            Err(Error::Unauthorized(Denial::NoSession))
        ));
    }

    #[actix_web::test]
    async fn test_pending_is_blocked_for_every_role() {
        let fx = fixture();
        fx.access
            .register(registration("asha@example.com", "1CK23EC001"))
            .await
            .unwrap();
        let (session, _) = fx.access.login("asha@example.com", "secret1").await.unwrap();

        for role in [Role::Student, Role::Admin] {
            assert!(matches!(
                fx.access.require_role(&session.token, role).await,
                Err(Error::Unauthorized(Denial::PendingApproval))
            ));
        }

        // the session survives the pending check
        assert!(fx.access.authenticate(&session.token).await.is_ok());
    }

    #[actix_web::test]
    async fn test_student_denied_admin() {
        let fx = fixture();
        approved_student(&fx, "asha@example.com", "1CK23EC001").await;
        let (session, _) = fx.access.login("asha@example.com", "secret1").await.unwrap();

        assert!(matches!(
            fx.access.require_role(&session.token, Role::Admin).await,
            Err(Error::Unauthorized(Denial::WrongRole {
                actual: Role::Student
            }))
        ));
    }

    #[actix_web::test]
    async fn test_missing_account_forces_logout() {
        let fx = fixture();
        let user = approved_student(&fx, "asha@example.com", "1CK23EC001").await;
        let (session, _) = fx.access.login("asha@example.com", "secret1").await.unwrap();

        fx.store.delete_user(&user.id).await.unwrap();
        assert!(matches!(
            fx.access.require_role(&session.token, Role::Student).await,
            Err(Error::Unauthorized(Denial::UnknownUser))
        ));
        assert!(matches!(
            fx.access.authenticate(&session.token).await,
            Err(Error::Unauthorized(Denial::NoSession))
        ));
    }

    #[actix_web::test]
    async fn test_session_expires() {
        let fx = fixture();
        approved_student(&fx, "asha@example.com", "1CK23EC001").await;
        let (session, _) = fx.access.login("asha@example.com", "secret1").await.unwrap();

        fx.clock.advance(Duration::hours(25));
        assert!(matches!(
            fx.access.require_member(&session.token).await,
            Err(Error::Unauthorized(Denial::NoSession))
        ));
    }

    #[actix_web::test]
    async fn test_seed_admin_once() {
        let fx = fixture();
        let admin = fx
            .access
            .seed_admin("Library Administrator", "admin@example.edu", "admin@1234")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(admin.is_approved());

        let again = fx
            .access
            .seed_admin("Library Administrator", "admin@example.edu", "admin@1234")
            .await
            .unwrap();
        assert!(again.is_none());

        let (session, _) = fx
            .access
            .login("admin@example.edu", "admin@1234")
            .await
            .unwrap();
        assert!(fx.access.require_role(&session.token, Role::Admin).await.is_ok());
    }

    #[actix_web::test]
    async fn test_seed_second_admin() {
        let fx = fixture();
        let first = fx
            .access
            .seed_admin("Head Librarian", "head@example.edu", "admin@1234")
            .await
            .unwrap()
            .unwrap();
        let second = fx
            .access
            .seed_admin("Night Librarian", "Night@example.edu", "admin@5678")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.usn, second.usn);

        let (session, _) = fx
            .access
            .login("night@example.edu", "admin@5678")
            .await
            .unwrap();
        assert!(fx.access.require_role(&session.token, Role::Admin).await.is_ok());
    }

    #[actix_web::test]
    async fn test_change_and_reset_password() {
        let fx = fixture();
        approved_student(&fx, "asha@example.com", "1CK23EC001").await;
        let (session, _) = fx.access.login("asha@example.com", "secret1").await.unwrap();

        assert!(matches!(
            fx.access
                .change_password(&session.token, "nope", "newpass", "newpass")
                .await,
            Err(Error::Unauthorized(Denial::BadCredentials))
        ));
        assert!(matches!(
            fx.access
                .change_password(&session.token, "secret1", "abc", "abc")
                .await,
            Err(Error::ValidationFailed(Invalid::Field(_)))
        ));
        fx.access
            .change_password(&session.token, "secret1", "newpass", "newpass")
            .await
            .unwrap();
        assert!(fx.access.login("asha@example.com", "newpass").await.is_ok());

        assert!(matches!(
            fx.access
                .reset_password("asha@example.com", "1CK23EC999", "resetpw", "resetpw")
                .await,
            Err(Error::ValidationFailed(Invalid::NoMatchingAccount))
        ));
        fx.access
            .reset_password("asha@example.com", "1ck23ec001", "resetpw", "resetpw")
            .await
            .unwrap();

        assert!(matches!(
            fx.access.require_member(&session.token).await,
            Err(Error::Unauthorized(Denial::NoSession))
        ));
        assert!(fx.access.login("asha@example.com", "resetpw").await.is_ok());
    }

    #[actix_web::test]
    async fn test_profile_and_members() {
        let fx = fixture();
        let asha = approved_student(&fx, "asha@example.com", "1CK23EC001").await;
        fx.access
            .register(registration("ravi@example.com", "1CK23EC002"))
            .await
            .unwrap();

        let pending = fx.access.list_members(true).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].email, "ravi@example.com");
        assert_eq!(fx.access.list_members(false).await.unwrap().len(), 2);

        let (session, _) = fx.access.login("asha@example.com", "secret1").await.unwrap();
        let update = ProfileUpdate {
            name: Some("Asha R".to_string()),
            phone: Some("12345".to_string()),
        };
        assert!(matches!(
            fx.access.update_profile(&session.token, update).await,
            Err(Error::ValidationFailed(Invalid::MalformedPhone))
        ));

        let update = ProfileUpdate {
            name: Some("Asha R".to_string()),
            phone: None,
        };
        let updated = fx.access.update_profile(&session.token, update).await.unwrap();
        assert_eq!(updated.name, "Asha R");
        assert_eq!(updated.phone, "9876543210");

        let promoted = fx.access.set_role(&asha.id, Role::Admin).await.unwrap();
        assert_eq!(promoted.role, Role::Admin);
    }

    #[test]
    fn test_usn_pattern() {
        assert!(is_valid_usn("1CK23EC001"));
        assert!(is_valid_usn("1CK99ZZ999"));
        assert!(!is_valid_usn("1CK23ec001"));
        assert!(!is_valid_usn("1CK2EC0011"));
        assert!(!is_valid_usn("1CK23EC0011"));
        assert!(!is_valid_usn("ADMIN001"));
    }
}
