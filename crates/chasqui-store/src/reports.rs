//! Aggregate queries backing the AI report endpoints.

use chasqui_core::types::now_millis;
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ReportCounts {
    pub total: i64,
    pub active: i64,
    pub attending: i64,
    pub queued: i64,
    pub bot_owned: i64,
    pub closed_since: i64,
    pub inbound_since: i64,
    pub outbound_since: i64,
    pub failed_since: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvisorReportRow {
    pub advisor_id: String,
    pub display_name: String,
    pub attending: i64,
    pub accepted_since: i64,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagTotals {
    pub searches: i64,
    pub hits: i64,
    pub cost_usd: f64,
}

impl Store {
    pub fn report_counts(&self, since_ms: i64) -> Result<ReportCounts> {
        let db = self.db.lock().unwrap();
        let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> Result<i64> {
            Ok(db.query_row(sql, args, |row| row.get(0))?)
        };
        Ok(ReportCounts {
            total: count("SELECT COUNT(*) FROM conversations", &[])?,
            active: count(
                "SELECT COUNT(*) FROM conversations WHERE status = 'active'",
                &[],
            )?,
            attending: count(
                "SELECT COUNT(*) FROM conversations WHERE status = 'attending'",
                &[],
            )?,
            queued: count(
                "SELECT COUNT(*) FROM conversations
                 WHERE status = 'active' AND assigned_to IS NULL AND queued_at IS NOT NULL",
                &[],
            )?,
            bot_owned: count(
                "SELECT COUNT(*) FROM conversations
                 WHERE status != 'closed' AND bot_flow_id IS NOT NULL",
                &[],
            )?,
            closed_since: count(
                "SELECT COUNT(*) FROM conversations WHERE status = 'closed' AND updated_at >= ?1",
                &[&since_ms],
            )?,
            inbound_since: count(
                "SELECT COUNT(*) FROM messages WHERE direction = 'in' AND timestamp >= ?1",
                &[&since_ms],
            )?,
            outbound_since: count(
                "SELECT COUNT(*) FROM messages WHERE direction = 'out' AND timestamp >= ?1",
                &[&since_ms],
            )?,
            failed_since: count(
                "SELECT COUNT(*) FROM messages WHERE status = 'failed' AND timestamp >= ?1",
                &[&since_ms],
            )?,
        })
    }

    pub fn advisor_report(&self, since_ms: i64) -> Result<Vec<AdvisorReportRow>> {
        let advisors = self.list_advisors()?;
        let mut rows = Vec::with_capacity(advisors.len());
        for advisor in advisors {
            rows.push(AdvisorReportRow {
                attending: self.attending_count(&advisor.id)?,
                accepted_since: self.activity_count(&advisor.id, "accept", since_ms)?,
                online: self.is_online(&advisor.id)?,
                advisor_id: advisor.id,
                display_name: advisor.display_name,
            });
        }
        Ok(rows)
    }

    pub fn record_rag_usage(
        &self,
        conversation_id: Option<&str>,
        query: &str,
        found: bool,
        chunks_used: i64,
        cost_usd: f64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO rag_usage (id, conversation_id, query, found, chunks_used, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::now_v7().to_string(),
                conversation_id,
                query,
                found as i64,
                chunks_used,
                cost_usd,
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn rag_totals(&self, since_ms: i64) -> Result<RagTotals> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(found), 0), COALESCE(SUM(cost_usd), 0)
             FROM rag_usage WHERE created_at >= ?1",
            params![since_ms],
            |row| {
                Ok(RagTotals {
                    searches: row.get(0)?,
                    hits: row.get(1)?,
                    cost_usd: row.get(2)?,
                })
            },
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chasqui_core::types::ConversationKey;
    use crate::types::NewMessage;

    #[test]
    fn counts_reflect_state() {
        let s = Store::open_in_memory().unwrap();
        let key = ConversationKey::new("104", "519");
        let conv = s.upsert_on_inbound(&key, None, None).unwrap();
        s.append_message(&conv.id, NewMessage::inbound_text("hola", "wamid.1"))
            .unwrap();
        let counts = s.report_counts(0).unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.inbound_since, 1);
        assert_eq!(counts.failed_since, 0);
    }

    #[test]
    fn rag_totals_accumulate() {
        let s = Store::open_in_memory().unwrap();
        s.record_rag_usage(None, "precios", true, 3, 0.002).unwrap();
        s.record_rag_usage(None, "horarios", false, 0, 0.001).unwrap();
        let totals = s.rag_totals(0).unwrap();
        assert_eq!(totals.searches, 2);
        assert_eq!(totals.hits, 1);
        assert!((totals.cost_usd - 0.003).abs() < 1e-9);
    }
}
