//! Queue definitions and rosters.

use chasqui_core::hours::WeekSchedule;
use chasqui_core::types::now_millis;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    RoundRobin,
    LeastBusy,
    Manual,
}

impl DistributionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionMode::RoundRobin => "round_robin",
            DistributionMode::LeastBusy => "least_busy",
            DistributionMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(DistributionMode::RoundRobin),
            "least_busy" => Some(DistributionMode::LeastBusy),
            "manual" => Some(DistributionMode::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: String,
    pub name: String,
    pub distribution_mode: DistributionMode,
    pub max_concurrent: i64,
    pub status: String,
    /// Round-robin rotation cursor, persisted across restarts.
    pub rr_cursor: i64,
    /// Optional per-queue business hours.
    pub schedule: Option<WeekSchedule>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_queue(row: &rusqlite::Row<'_>) -> rusqlite::Result<Queue> {
    let mode =
        DistributionMode::parse(&row.get::<_, String>(2)?).unwrap_or(DistributionMode::RoundRobin);
    let schedule = row
        .get::<_, Option<String>>(6)?
        .and_then(|s| serde_json::from_str(&s).ok());
    Ok(Queue {
        id: row.get(0)?,
        name: row.get(1)?,
        distribution_mode: mode,
        max_concurrent: row.get(3)?,
        status: row.get(4)?,
        rr_cursor: row.get(5)?,
        schedule,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const QUEUE_COLS: &str =
    "id, name, distribution_mode, max_concurrent, status, rr_cursor, schedule, created_at, updated_at";

impl Store {
    pub fn create_queue(
        &self,
        name: &str,
        distribution_mode: DistributionMode,
        max_concurrent: i64,
    ) -> Result<Queue> {
        if max_concurrent < 1 {
            return Err(StoreError::Validation("max_concurrent must be >= 1".into()));
        }
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO queues (id, name, distribution_mode, max_concurrent, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                params![id, name, distribution_mode.as_str(), max_concurrent, now],
            )?;
        }
        self.get_queue(&id)
    }

    pub fn get_queue(&self, id: &str) -> Result<Queue> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {QUEUE_COLS} FROM queues WHERE id = ?1"),
            params![id],
            row_to_queue,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: "queue",
            id: id.to_string(),
        })
    }

    pub fn find_queue_by_name(&self, name: &str) -> Result<Option<Queue>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                &format!("SELECT {QUEUE_COLS} FROM queues WHERE name = ?1 LIMIT 1"),
                params![name],
                row_to_queue,
            )
            .optional()?)
    }

    pub fn list_queues(&self) -> Result<Vec<Queue>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("SELECT {QUEUE_COLS} FROM queues ORDER BY name"))?;
        let rows = stmt.query_map([], row_to_queue)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_queue_schedule(&self, queue_id: &str, schedule: Option<&WeekSchedule>) -> Result<()> {
        let json = schedule.map(serde_json::to_string).transpose()?;
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE queues SET schedule = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, now_millis(), queue_id],
        )?;
        Ok(())
    }

    pub fn add_queue_member(&self, queue_id: &str, advisor_id: &str, is_supervisor: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO queue_members (queue_id, advisor_id, is_supervisor)
             VALUES (?1, ?2, ?3)",
            params![queue_id, advisor_id, is_supervisor as i64],
        )?;
        Ok(())
    }

    pub fn remove_queue_member(&self, queue_id: &str, advisor_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM queue_members WHERE queue_id = ?1 AND advisor_id = ?2",
            params![queue_id, advisor_id],
        )?;
        Ok(())
    }

    /// Assigned (non-supervisor) advisor ids, stable order.
    pub fn queue_member_ids(&self, queue_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT advisor_id FROM queue_members
             WHERE queue_id = ?1 AND is_supervisor = 0
             ORDER BY advisor_id",
        )?;
        let rows = stmt.query_map(params![queue_id], |row| row.get(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Queues an advisor participates in (supervisors included).
    pub fn queues_for_advisor(&self, advisor_id: &str) -> Result<Vec<Queue>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {QUEUE_COLS} FROM queues q
             JOIN queue_members m ON m.queue_id = q.id
             WHERE m.advisor_id = ?1
             ORDER BY q.name"
        ))?;
        let rows = stmt.query_map(params![advisor_id], row_to_queue)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Advance and return the round-robin cursor for a queue.
    pub fn advance_rr_cursor(&self, queue_id: &str) -> Result<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE queues SET rr_cursor = rr_cursor + 1 WHERE id = ?1",
            params![queue_id],
        )?;
        Ok(db.query_row(
            "SELECT rr_cursor FROM queues WHERE id = ?1",
            params![queue_id],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisors::AdvisorRole;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn queue_roundtrip_with_schedule() {
        let s = store();
        let q = s
            .create_queue("Ventas", DistributionMode::RoundRobin, 5)
            .unwrap();
        assert_eq!(q.distribution_mode, DistributionMode::RoundRobin);
        assert!(q.schedule.is_none());

        let schedule = WeekSchedule {
            days: vec![chasqui_core::hours::DayHours {
                day: 0,
                open: "09:00".into(),
                close: "18:00".into(),
            }],
        };
        s.set_queue_schedule(&q.id, Some(&schedule)).unwrap();
        assert_eq!(s.get_queue(&q.id).unwrap().schedule, Some(schedule));
    }

    #[test]
    fn membership_and_cursor() {
        let s = store();
        let q = s.create_queue("Soporte", DistributionMode::LeastBusy, 3).unwrap();
        let a = s
            .create_advisor("ana", "Ana", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        let b = s
            .create_advisor("beto", "Beto", AdvisorRole::Advisor, "correcthorse")
            .unwrap();
        s.add_queue_member(&q.id, &a.id, false).unwrap();
        s.add_queue_member(&q.id, &b.id, false).unwrap();

        assert_eq!(s.queue_member_ids(&q.id).unwrap().len(), 2);
        assert_eq!(s.queues_for_advisor(&a.id).unwrap().len(), 1);

        assert_eq!(s.advance_rr_cursor(&q.id).unwrap(), 1);
        assert_eq!(s.advance_rr_cursor(&q.id).unwrap(), 2);

        s.remove_queue_member(&q.id, &a.id).unwrap();
        assert_eq!(s.queue_member_ids(&q.id).unwrap(), vec![b.id]);
    }

    #[test]
    fn zero_capacity_rejected() {
        let s = store();
        assert!(s.create_queue("X", DistributionMode::Manual, 0).is_err());
    }
}
