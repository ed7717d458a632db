//! Advisors, their status catalogue, login sessions and the activity log.
//!
//! An advisor is *online* iff at least one advisor session has no
//! `end_time`. The effective status ⟨status_id, is_manually_offline⟩
//! decides assignment eligibility together with queue membership.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chasqui_core::types::now_millis;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorRole {
    Admin,
    Supervisor,
    Advisor,
}

impl AdvisorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvisorRole::Admin => "admin",
            AdvisorRole::Supervisor => "supervisor",
            AdvisorRole::Advisor => "advisor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(AdvisorRole::Admin),
            "supervisor" => Some(AdvisorRole::Supervisor),
            "advisor" => Some(AdvisorRole::Advisor),
            _ => None,
        }
    }
}

/// What assignment does with an advisor in this status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusAction {
    Accept,
    Redirect,
    Pause,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusAction::Accept => "accept",
            StatusAction::Redirect => "redirect",
            StatusAction::Pause => "pause",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(StatusAction::Accept),
            "redirect" => Some(StatusAction::Redirect),
            "pause" => Some(StatusAction::Pause),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advisor {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: AdvisorRole,
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Per-user UI theme prefs, opaque JSON.
    pub theme: Option<serde_json::Value>,
    pub is_manually_offline: bool,
    pub last_assignment_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorStatus {
    pub id: String,
    pub name: String,
    pub color: String,
    pub action: StatusAction,
    pub redirect_queue: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvisorSession {
    pub id: String,
    pub advisor_id: String,
    pub conversation_id: Option<String>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration: Option<i64>,
}

const ADVISOR_COLS: &str = "id, username, display_name, role, password_hash, theme, \
     is_manually_offline, last_assignment_at, created_at, updated_at";

fn row_to_advisor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Advisor> {
    let role = AdvisorRole::parse(&row.get::<_, String>(3)?).unwrap_or(AdvisorRole::Advisor);
    let theme = row
        .get::<_, Option<String>>(5)?
        .and_then(|s| serde_json::from_str(&s).ok());
    Ok(Advisor {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        role,
        password_hash: row.get(4)?,
        theme,
        is_manually_offline: row.get::<_, i64>(6)? != 0,
        last_assignment_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdvisorStatus> {
    let action = StatusAction::parse(&row.get::<_, String>(3)?).unwrap_or(StatusAction::Accept);
    Ok(AdvisorStatus {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        action,
        redirect_queue: row.get(4)?,
        is_default: row.get::<_, i64>(5)? != 0,
    })
}

impl Store {
    // ── Advisors ────────────────────────────────────────────────────────

    pub fn create_advisor(
        &self,
        username: &str,
        display_name: &str,
        role: AdvisorRole,
        password: &str,
    ) -> Result<Advisor> {
        if password.len() < 8 {
            return Err(StoreError::Validation(
                "password must be at least 8 characters".into(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let hash = hash_password(password)?;
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO advisors (id, username, display_name, role, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, username, display_name, role.as_str(), hash, now],
            )?;
        }
        self.get_advisor(&id)
    }

    pub fn get_advisor(&self, id: &str) -> Result<Advisor> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {ADVISOR_COLS} FROM advisors WHERE id = ?1"),
            params![id],
            row_to_advisor,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: "advisor",
            id: id.to_string(),
        })
    }

    pub fn get_advisor_by_username(&self, username: &str) -> Result<Option<Advisor>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                &format!("SELECT {ADVISOR_COLS} FROM advisors WHERE username = ?1"),
                params![username],
                row_to_advisor,
            )
            .optional()?)
    }

    pub fn list_advisors(&self) -> Result<Vec<Advisor>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare(&format!("SELECT {ADVISOR_COLS} FROM advisors ORDER BY username"))?;
        let rows = stmt.query_map([], row_to_advisor)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn verify_password(&self, username: &str, password: &str) -> Result<Option<Advisor>> {
        let Some(advisor) = self.get_advisor_by_username(username)? else {
            return Ok(None);
        };
        let parsed = PasswordHash::new(&advisor.password_hash)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(Some(advisor)),
            Err(_) => Ok(None),
        }
    }

    pub fn set_manually_offline(&self, advisor_id: &str, offline: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE advisors SET is_manually_offline = ?1, updated_at = ?2 WHERE id = ?3",
            params![offline as i64, now_millis(), advisor_id],
        )?;
        Ok(())
    }

    // ── Status catalogue ────────────────────────────────────────────────

    /// Seed the default "Disponible" status on first boot so there is
    /// always exactly one default.
    pub fn ensure_default_status(&self) -> Result<AdvisorStatus> {
        if let Some(existing) = self.default_status()? {
            return Ok(existing);
        }
        let id = Uuid::new_v4().to_string();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO advisor_statuses (id, name, color, action, is_default)
                 VALUES (?1, 'Disponible', '#4caf50', 'accept', 1)",
                params![id],
            )?;
        }
        self.get_status(&id)
    }

    pub fn default_status(&self) -> Result<Option<AdvisorStatus>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                "SELECT id, name, color, action, redirect_queue, is_default
                 FROM advisor_statuses WHERE is_default = 1 LIMIT 1",
                [],
                row_to_status,
            )
            .optional()?)
    }

    pub fn get_status(&self, id: &str) -> Result<AdvisorStatus> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, name, color, action, redirect_queue, is_default
             FROM advisor_statuses WHERE id = ?1",
            params![id],
            row_to_status,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: "advisor status",
            id: id.to_string(),
        })
    }

    pub fn create_status(
        &self,
        name: &str,
        color: &str,
        action: StatusAction,
        redirect_queue: Option<&str>,
        is_default: bool,
    ) -> Result<AdvisorStatus> {
        let id = Uuid::new_v4().to_string();
        {
            let mut db = self.db.lock().unwrap();
            let tx = db.transaction()?;
            if is_default {
                tx.execute("UPDATE advisor_statuses SET is_default = 0", [])?;
            }
            tx.execute(
                "INSERT INTO advisor_statuses (id, name, color, action, redirect_queue, is_default)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, name, color, action.as_str(), redirect_queue, is_default as i64],
            )?;
            tx.commit()?;
        }
        self.get_status(&id)
    }

    /// Assign a status to an advisor (upsert).
    pub fn set_advisor_status(&self, advisor_id: &str, status_id: &str) -> Result<()> {
        // Ensure the status exists before recording the assignment.
        self.get_status(status_id)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO advisor_status_assignments (advisor_id, status_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(advisor_id) DO UPDATE SET status_id = ?2, updated_at = ?3",
            params![advisor_id, status_id, now_millis()],
        )?;
        Ok(())
    }

    /// The advisor's effective status: the assigned one, else the default.
    pub fn effective_status(&self, advisor_id: &str) -> Result<Option<AdvisorStatus>> {
        let assigned: Option<String> = {
            let db = self.db.lock().unwrap();
            db.query_row(
                "SELECT status_id FROM advisor_status_assignments WHERE advisor_id = ?1",
                params![advisor_id],
                |row| row.get(0),
            )
            .optional()?
        };
        match assigned {
            Some(status_id) => Ok(Some(self.get_status(&status_id)?)),
            None => self.default_status(),
        }
    }

    // ── Login sessions ──────────────────────────────────────────────────

    pub fn start_advisor_session(&self, advisor_id: &str) -> Result<AdvisorSession> {
        let id = Uuid::now_v7().to_string();
        let now = now_millis();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO advisor_sessions (id, advisor_id, start_time) VALUES (?1, ?2, ?3)",
                params![id, advisor_id, now],
            )?;
        }
        self.log_activity(advisor_id, "login", "{}")?;
        Ok(AdvisorSession {
            id,
            advisor_id: advisor_id.to_string(),
            conversation_id: None,
            start_time: now,
            end_time: None,
            duration: None,
        })
    }

    /// Close every open session for the advisor. Returns how many closed.
    pub fn end_advisor_sessions(&self, advisor_id: &str) -> Result<usize> {
        let now = now_millis();
        let n = {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE advisor_sessions
                 SET end_time = ?1, duration = ?1 - start_time
                 WHERE advisor_id = ?2 AND end_time IS NULL",
                params![now, advisor_id],
            )?
        };
        if n > 0 {
            self.log_activity(advisor_id, "logout", "{}")?;
        }
        Ok(n)
    }

    pub fn is_online(&self, advisor_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM advisor_sessions WHERE advisor_id = ?1 AND end_time IS NULL",
            params![advisor_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Activity log ────────────────────────────────────────────────────

    pub fn log_activity(&self, advisor_id: &str, action: &str, details_json: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO advisor_activity_logs (id, advisor_id, action, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::now_v7().to_string(),
                advisor_id,
                action,
                details_json,
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn activity_count(&self, advisor_id: &str, action: &str, since_ms: i64) -> Result<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*) FROM advisor_activity_logs
             WHERE advisor_id = ?1 AND action = ?2 AND created_at >= ?3",
            params![advisor_id, action, since_ms],
            |row| row.get(0),
        )?)
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| StoreError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn password_hash_verifies_and_rejects() {
        let s = store();
        s.create_advisor("ana", "Ana Díaz", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        assert!(s.verify_password("ana", "correcthorse").unwrap().is_some());
        assert!(s.verify_password("ana", "wrong-password").unwrap().is_none());
        assert!(s.verify_password("nadie", "whatever").unwrap().is_none());
    }

    #[test]
    fn short_password_rejected() {
        let s = store();
        assert!(matches!(
            s.create_advisor("ana", "Ana", AdvisorRole::Advisor, "short"),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn online_iff_open_session_exists() {
        let s = store();
        let adv = s
            .create_advisor("ana", "Ana", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        assert!(!s.is_online(&adv.id).unwrap());
        s.start_advisor_session(&adv.id).unwrap();
        assert!(s.is_online(&adv.id).unwrap());
        assert_eq!(s.end_advisor_sessions(&adv.id).unwrap(), 1);
        assert!(!s.is_online(&adv.id).unwrap());
    }

    #[test]
    fn exactly_one_default_status() {
        let s = store();
        let first = s.ensure_default_status().unwrap();
        assert!(first.is_default);
        // Creating a new default demotes the old one.
        let second = s
            .create_status("Almuerzo", "#ff9800", StatusAction::Pause, None, true)
            .unwrap();
        assert!(second.is_default);
        let db = s.db.lock().unwrap();
        let defaults: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM advisor_statuses WHERE is_default = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(defaults, 1);
    }

    #[test]
    fn effective_status_falls_back_to_default() {
        let s = store();
        s.ensure_default_status().unwrap();
        let adv = s
            .create_advisor("ana", "Ana", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        let eff = s.effective_status(&adv.id).unwrap().unwrap();
        assert!(eff.is_default);
        assert_eq!(eff.action, StatusAction::Accept);

        let paused = s
            .create_status("Pausa", "#999", StatusAction::Pause, None, false)
            .unwrap();
        s.set_advisor_status(&adv.id, &paused.id).unwrap();
        let eff = s.effective_status(&adv.id).unwrap().unwrap();
        assert_eq!(eff.action, StatusAction::Pause);
    }
}
