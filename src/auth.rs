//! Email/password authentication with bcrypt.
//!
//! Users live in the `users` table. Sessions are kept in memory and keyed by
//! an opaque token; failed-login counters are persisted in `local_settings`
//! (category "auth") so a lockout survives a restart. Peer instances that
//! replay their sync queue here authenticate with a configured API key
//! instead of a session.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::AdminConfig;
use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::User;
use crate::validation::{optional_string, require_fields};

/// Role carried by requests authenticated with an API key.
pub const SERVICE_ROLE: &str = "service";

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 12;
const MIN_PASSWORD_LEN: usize = 8;
const SETTINGS_CATEGORY: &str = "auth";

#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

const INVALID_CREDENTIALS: &str = "Invalid credentials";

#[derive(Clone)]
struct Session {
    user: User,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
            || now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }
}

struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

/// In-memory session registry shared by the HTTP handlers, plus the API
/// keys accepted from peer instances.
#[derive(Default)]
pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
    api_keys: Vec<Zeroizing<String>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_keys(keys: Vec<Zeroizing<String>>) -> Self {
        Self {
            sessions: Mutex::default(),
            api_keys: keys.into_iter().filter(|k| !k.trim().is_empty()).collect(),
        }
    }

    fn api_key_user(&self, token: &str) -> Option<User> {
        let matched = self
            .api_keys
            .iter()
            .any(|key| constant_time_eq(key.as_bytes(), token.as_bytes()));
        matched.then(|| User {
            id: SERVICE_ROLE.into(),
            email: String::new(),
            full_name: "Sync peer".into(),
            role: SERVICE_ROLE.into(),
        })
    }

    fn sessions(&self) -> AppResult<MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| AppError::Internal("session registry poisoned".into()))
    }

    fn open_session(&self, user: User, now: DateTime<Utc>) -> AppResult<String> {
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions()?;
        sessions.retain(|_, s| !s.is_expired_at(now));
        sessions.insert(
            token.clone(),
            Session {
                user,
                last_activity: now,
                expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
            },
        );
        Ok(token)
    }

    /// Resolve a token and refresh its inactivity timer.
    fn session_at(&self, token: &str, now: DateTime<Utc>) -> AppResult<Option<User>> {
        let mut sessions = self.sessions()?;
        let Some(session) = sessions.get_mut(token) else {
            return Ok(None);
        };
        if !session.is_expired_at(now) {
            session.last_activity = now;
            return Ok(Some(session.user.clone()));
        }
        sessions.remove(token);
        Ok(None)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Lockout
// ---------------------------------------------------------------------------

fn attempts_key(email: &str) -> String {
    format!("lockout_attempts:{email}")
}

fn last_attempt_key(email: &str) -> String {
    format!("lockout_last_attempt:{email}")
}

fn load_lockout(conn: &Connection, email: &str) -> LockoutEntry {
    let attempts = db::get_setting(conn, SETTINGS_CATEGORY, &attempts_key(email))
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, SETTINGS_CATEGORY, &last_attempt_key(email))
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    LockoutEntry {
        attempts,
        last_attempt,
    }
}

fn persist_lockout(conn: &Connection, email: &str, lockout: &LockoutEntry) -> AppResult<()> {
    db::set_setting(
        conn,
        SETTINGS_CATEGORY,
        &attempts_key(email),
        &lockout.attempts.to_string(),
    )?;
    db::set_setting(
        conn,
        SETTINGS_CATEGORY,
        &last_attempt_key(email),
        &lockout.last_attempt.to_rfc3339(),
    )
}

fn check_lockout(lockout: &LockoutEntry, now: DateTime<Utc>) -> AppResult<()> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = now - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            let remaining = LOCKOUT_MINUTES - elapsed.num_minutes();
            return Err(AppError::Unauthorized(format!(
                "Too many failed attempts. Try again in {remaining} minute(s)."
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !email
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '"'))
        }
        None => false,
    }
}

fn find_credentials(conn: &Connection, email: &str) -> AppResult<Option<(User, String)>> {
    let found = conn
        .query_row(
            "SELECT id, email, full_name, role, password_hash FROM users WHERE email = ?1",
            params![email],
            |row| {
                Ok((
                    User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        full_name: row.get(2)?,
                        role: row.get(3)?,
                    },
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    Ok(found)
}

fn insert_user(conn: &Connection, email: &str, password: &str, full_name: &str, role: &str) -> AppResult<User> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(AppError::Validation("Invalid email address".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let hash = bcrypt::hash(password, BCRYPT_COST)
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {e}")))?;
    let user = User {
        id: Uuid::new_v4().to_string(),
        email,
        full_name: full_name.trim().to_string(),
        role: role.to_string(),
    };
    conn.execute(
        "INSERT INTO users (id, email, password_hash, full_name, role) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user.id, user.email, hash, user.full_name, user.role],
    )
    .map_err(|e| match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("Email already registered".into()),
        other => other,
    })?;
    Ok(user)
}

/// Register a user from a `{email, password, fullName, role?}` payload.
pub fn create_user(db: &DbState, payload: &Value) -> AppResult<User> {
    require_fields(payload, &["email", "password", "fullName"])?;
    // Emails are compared verbatim at login, so they skip HTML escaping.
    let email = payload
        .get("email")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let full_name = optional_string(payload, "fullName").unwrap_or_default();
    let role = optional_string(payload, "role").unwrap_or_else(|| "staff".into());
    let password = payload
        .get("password")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let conn = db.lock()?;
    let user = insert_user(&conn, email, password, &full_name, &role)?;
    info!(user_id = %user.id, role = %user.role, "user created");
    Ok(user)
}

/// Seed the configured administrator when no user exists yet.
pub fn ensure_admin(db: &DbState, admin: &AdminConfig) -> AppResult<Option<User>> {
    let conn = db.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(None);
    }
    let Some(password) = admin.password.as_ref() else {
        warn!("no users exist and no admin password is configured; login is impossible");
        return Ok(None);
    };
    let user = insert_user(&conn, &admin.email, password, &admin.full_name, "admin")?;
    info!(email = %user.email, "seeded administrator account");
    Ok(Some(user))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub fn login(db: &DbState, auth: &AuthState, email: &str, password: &str) -> AppResult<LoginResponse> {
    login_at(db, auth, email, password, Utc::now())
}

fn login_at(
    db: &DbState,
    auth: &AuthState,
    email: &str,
    password: &str,
    now: DateTime<Utc>,
) -> AppResult<LoginResponse> {
    let email = normalize_email(email);
    if email.is_empty() || password.is_empty() {
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.into()));
    }

    let conn = db.lock()?;
    let mut lockout = load_lockout(&conn, &email);
    check_lockout(&lockout, now)?;

    let credentials = find_credentials(&conn, &email)?;
    let known_account = credentials.is_some();
    let verified = match credentials {
        Some((user, hash)) if bcrypt::verify(password, &hash).unwrap_or(false) => Some(user),
        _ => None,
    };

    let Some(user) = verified else {
        if !known_account {
            // Counters are only kept for real accounts.
            warn!("failed login attempt for unknown account");
            return Err(AppError::Unauthorized(INVALID_CREDENTIALS.into()));
        }
        if lockout.attempts >= MAX_FAILED_ATTEMPTS {
            // The previous lockout window has run out; start counting again.
            lockout.attempts = 0;
        }
        lockout.attempts += 1;
        lockout.last_attempt = now;
        persist_lockout(&conn, &email, &lockout)?;
        warn!(attempts = lockout.attempts, "failed login attempt");
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.into()));
    };

    if lockout.attempts > 0 {
        lockout.attempts = 0;
        lockout.last_attempt = now;
        persist_lockout(&conn, &email, &lockout)?;
    }
    drop(conn);

    let token = auth.open_session(user.clone(), now)?;
    info!(user_id = %user.id, "login successful");
    Ok(LoginResponse { token, user })
}

/// The user behind a live session token, if any.
pub fn session(auth: &AuthState, token: &str) -> AppResult<Option<User>> {
    match auth.session_at(token, Utc::now())? {
        Some(user) => Ok(Some(user)),
        None => Ok(auth.api_key_user(token)),
    }
}

pub fn logout(auth: &AuthState, token: &str) -> AppResult<()> {
    if auth.sessions()?.remove(token).is_some() {
        info!("session logged out");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> (DbState, AuthState) {
        let db = db::open_in_memory().unwrap();
        create_user(
            &db,
            &json!({ "email": "Dr.Ada@Clinic.example", "password": "correct horse", "fullName": "Ada" }),
        )
        .unwrap();
        (db, AuthState::new())
    }

    fn lockout_attempts(db: &DbState, email: &str) -> u32 {
        let conn = db.lock().unwrap();
        db::get_setting(&conn, SETTINGS_CATEGORY, &attempts_key(email))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    }

    #[test]
    fn login_then_session_then_logout() {
        let (db, auth) = seeded();
        let response = login(&db, &auth, " dr.ada@clinic.example ", "correct horse").unwrap();
        assert_eq!(response.user.email, "dr.ada@clinic.example");
        assert_eq!(response.user.role, "staff");

        let user = session(&auth, &response.token).unwrap().unwrap();
        assert_eq!(user.id, response.user.id);

        logout(&auth, &response.token).unwrap();
        assert!(session(&auth, &response.token).unwrap().is_none());
    }

    #[test]
    fn wrong_password_and_unknown_user_look_the_same() {
        let (db, auth) = seeded();
        let wrong = login(&db, &auth, "dr.ada@clinic.example", "nope nope").unwrap_err();
        let unknown = login(&db, &auth, "ghost@clinic.example", "correct horse").unwrap_err();
        assert_eq!(wrong.to_string(), INVALID_CREDENTIALS);
        assert_eq!(unknown.to_string(), INVALID_CREDENTIALS);
        assert!(matches!(wrong, AppError::Unauthorized(_)));
    }

    #[test]
    fn lockout_persists_across_auth_state_restart() {
        let (db, auth) = seeded();
        let email = "dr.ada@clinic.example";
        for _ in 0..MAX_FAILED_ATTEMPTS {
            login(&db, &auth, email, "wrong password").unwrap_err();
        }
        assert_eq!(lockout_attempts(&db, email), MAX_FAILED_ATTEMPTS);

        let restarted = AuthState::new();
        let err = login(&db, &restarted, email, "correct horse").unwrap_err();
        assert!(err.to_string().contains("Too many failed attempts"), "{err}");
        assert_eq!(lockout_attempts(&db, email), MAX_FAILED_ATTEMPTS);
    }

    #[test]
    fn lockout_expires_after_window() {
        let (db, auth) = seeded();
        let email = "dr.ada@clinic.example";
        let start = Utc::now();
        for _ in 0..MAX_FAILED_ATTEMPTS {
            login_at(&db, &auth, email, "wrong password", start).unwrap_err();
        }
        let later = start + Duration::minutes(LOCKOUT_MINUTES + 1);
        login_at(&db, &auth, email, "correct horse", later).unwrap();
        assert_eq!(lockout_attempts(&db, email), 0);
    }

    #[test]
    fn successful_login_resets_counter() {
        let (db, auth) = seeded();
        let email = "dr.ada@clinic.example";
        login(&db, &auth, email, "wrong password").unwrap_err();
        login(&db, &auth, email, "wrong password").unwrap_err();
        assert_eq!(lockout_attempts(&db, email), 2);

        login(&db, &auth, email, "correct horse").unwrap();
        assert_eq!(lockout_attempts(&db, email), 0);
    }

    #[test]
    fn sessions_expire_on_idle_and_on_max_age() {
        let (db, auth) = seeded();
        let start = Utc::now();
        let token = login_at(&db, &auth, "dr.ada@clinic.example", "correct horse", start)
            .unwrap()
            .token;

        // Activity every 20 minutes keeps it alive until the hard cap.
        let mut now = start;
        for _ in 0..(SESSION_MAX_DURATION_HOURS * 3 - 1) {
            now += Duration::minutes(20);
            assert!(auth.session_at(&token, now).unwrap().is_some());
        }
        now += Duration::minutes(20);
        assert!(auth.session_at(&token, now).unwrap().is_none());

        let idle = login_at(&db, &auth, "dr.ada@clinic.example", "correct horse", start)
            .unwrap()
            .token;
        let after_idle = start + Duration::minutes(SESSION_INACTIVITY_MINUTES + 1);
        assert!(auth.session_at(&idle, after_idle).unwrap().is_none());
    }

    #[test]
    fn unknown_accounts_leave_no_lockout_rows() {
        let (db, auth) = seeded();
        for i in 0..20 {
            login(&db, &auth, &format!("ghost{i}@clinic.example"), "whatever").unwrap_err();
        }
        let conn = db.lock().unwrap();
        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM local_settings WHERE setting_category = ?1",
                params![SETTINGS_CATEGORY],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn emails_with_markup_characters_can_log_in() {
        let db = db::open_in_memory().unwrap();
        let auth = AuthState::new();
        let user = create_user(
            &db,
            &json!({ "email": "o'neil&co@clinic.example", "password": "long enough", "fullName": "Pat" }),
        )
        .unwrap();
        assert_eq!(user.email, "o'neil&co@clinic.example");
        login(&db, &auth, " O'Neil&Co@clinic.example", "long enough").unwrap();
    }

    #[test]
    fn api_keys_authenticate_as_service() {
        let auth = AuthState::with_api_keys(vec![
            Zeroizing::new("peer-key-1".to_string()),
            Zeroizing::new("  ".to_string()),
        ]);
        let user = session(&auth, "peer-key-1").unwrap().unwrap();
        assert_eq!(user.role, SERVICE_ROLE);
        assert!(session(&auth, "peer-key-2").unwrap().is_none());
        assert!(session(&auth, "").unwrap().is_none());
        assert!(session(&AuthState::new(), "peer-key-1").unwrap().is_none());
    }

    #[test]
    fn create_user_validates_input() {
        let db = db::open_in_memory().unwrap();
        let err = create_user(
            &db,
            &json!({ "email": "not-an-email", "password": "long enough", "fullName": "X" }),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid email address");

        let err = create_user(
            &db,
            &json!({ "email": "a@b.example", "password": "short", "fullName": "X" }),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Password must be at least 8 characters");

        create_user(
            &db,
            &json!({ "email": "a@b.example", "password": "long enough", "fullName": "X" }),
        )
        .unwrap();
        let err = create_user(
            &db,
            &json!({ "email": "A@B.example", "password": "long enough", "fullName": "Y" }),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn ensure_admin_seeds_only_an_empty_table() {
        let db = db::open_in_memory().unwrap();
        let admin = AdminConfig {
            email: "admin@clinic.example".into(),
            full_name: "Administrator".into(),
            password: Some(zeroize::Zeroizing::new("bootstrap-pass".into())),
        };
        let seeded = ensure_admin(&db, &admin).unwrap().unwrap();
        assert_eq!(seeded.role, "admin");
        assert!(ensure_admin(&db, &admin).unwrap().is_none());

        let auth = AuthState::new();
        login(&db, &auth, "admin@clinic.example", "bootstrap-pass").unwrap();
    }

    #[test]
    fn ensure_admin_without_password_is_a_no_op() {
        let db = db::open_in_memory().unwrap();
        let admin = AdminConfig {
            email: "admin@clinic.example".into(),
            full_name: "Administrator".into(),
            password: None,
        };
        assert!(ensure_admin(&db, &admin).unwrap().is_none());
    }
}
