//! Lead repository (PostgreSQL)

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use lc_common::{Lead, LeadCounter, LeadStatus};

use super::{lead_from_row, millis, opt_millis, PostgresStore};
use crate::repository::LeadRepository;
use crate::{Result, StoreError};

const LEAD_COLUMNS: &str = "id, email, name, company, city, country, timezone, emails_sent, \
     emails_opened, emails_clicked, emails_bounced, score, tags, status_step, status_state, \
     frozen_until, created_at, updated_at";

#[async_trait]
impl LeadRepository for PostgresStore {
    async fn insert(&self, lead: &Lead) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO leads
                (id, email, name, company, city, country, timezone, emails_sent, emails_opened,
                 emails_clicked, emails_bounced, score, tags, status_step, status_state,
                 frozen_until, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(lead.id)
        .bind(&lead.email)
        .bind(&lead.name)
        .bind(&lead.company)
        .bind(&lead.city)
        .bind(&lead.country)
        .bind(&lead.timezone)
        .bind(lead.emails_sent)
        .bind(lead.emails_opened)
        .bind(lead.emails_clicked)
        .bind(lead.emails_bounced)
        .bind(lead.score)
        .bind(serde_json::to_value(&lead.tags)?)
        .bind(lead.status.as_ref().map(|s| s.step.clone()))
        .bind(lead.status.as_ref().map(|s| s.state.as_str()))
        .bind(opt_millis(lead.frozen_until))
        .bind(millis(lead.created_at))
        .bind(millis(lead.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(format!("lead email {}", lead.email)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Lead>> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Lead>> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM leads WHERE email = $1"))
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lead_from_row).transpose()
    }

    async fn update_status(&self, id: Uuid, status: &LeadStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE leads SET status_step = $2, status_state = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(&status.step)
        .bind(status.state.as_str())
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("lead {id}")));
        }
        Ok(())
    }

    async fn increment_counter(&self, id: Uuid, counter: LeadCounter) -> Result<()> {
        let column = match counter {
            LeadCounter::Sent => "emails_sent",
            LeadCounter::Opened => "emails_opened",
            LeadCounter::Clicked => "emails_clicked",
            LeadCounter::Bounced => "emails_bounced",
        };

        let query = format!(
            "UPDATE leads SET {column} = {column} + 1, updated_at = $2 WHERE id = $1"
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(millis(Utc::now()))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("lead {id}")));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        // email_jobs and email_schedules cascade via FK.
        sqlx::query("DELETE FROM leads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
