//! Configuration documents, projections and auxiliary tables (PostgreSQL)

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use lc_common::{
    ConditionalEmail, EmailSchedule, EmailTemplate, EventKind, ManualMail, Notification,
    Settings, StepSnapshot,
};

use super::{from_millis, from_opt_millis, millis, opt_millis, parse_status, PostgresStore};
use crate::repository::{
    ConditionalEmailRepository, ManualMailRepository, NotificationRepository, ScheduleRepository,
    SettingsRepository, TemplateRepository,
};
use crate::{Result, StoreError};

const SETTINGS_ID: &str = "global";

#[async_trait]
impl SettingsRepository for PostgresStore {
    async fn get(&self) -> Result<Settings> {
        let row = sqlx::query("SELECT document FROM settings WHERE id = $1")
            .bind(SETTINGS_ID)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let document: serde_json::Value = row.get("document");
                Ok(serde_json::from_value(document)?)
            }
            None => Ok(Settings::default()),
        }
    }

    async fn update(&self, settings: &Settings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (id, document, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET document = $2, updated_at = $3
            "#,
        )
        .bind(SETTINGS_ID)
        .bind(serde_json::to_value(settings)?)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleRepository for PostgresStore {
    async fn get(&self, lead_id: Uuid) -> Result<Option<EmailSchedule>> {
        let row = sqlx::query(
            "SELECT lead_id, initial_status, followups, conditionals, updated_at \
             FROM email_schedules WHERE lead_id = $1",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let followups: Vec<StepSnapshot> = serde_json::from_value(row.get("followups"))?;
            let conditionals: Vec<StepSnapshot> = serde_json::from_value(row.get("conditionals"))?;
            Ok(EmailSchedule {
                lead_id: row.get("lead_id"),
                initial_status: parse_status(&row.get::<String, _>("initial_status"))?,
                followups,
                conditionals,
                updated_at: from_millis(row.get("updated_at"))?,
            })
        })
        .transpose()
    }

    async fn upsert(&self, schedule: &EmailSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_schedules (lead_id, initial_status, followups, conditionals, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (lead_id) DO UPDATE
            SET initial_status = $2, followups = $3, conditionals = $4, updated_at = $5
            "#,
        )
        .bind(schedule.lead_id)
        .bind(schedule.initial_status.as_str())
        .bind(serde_json::to_value(&schedule.followups)?)
        .bind(serde_json::to_value(&schedule.conditionals)?)
        .bind(millis(schedule.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConditionalEmailRepository for PostgresStore {
    async fn insert(&self, conditional: &ConditionalEmail) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conditional_emails
                (id, name, trigger_event, trigger_step, delay_hours, template_id,
                 cancel_pending, priority, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(conditional.id)
        .bind(&conditional.name)
        .bind(conditional.trigger_event.as_str())
        .bind(&conditional.trigger_step)
        .bind(conditional.delay_hours)
        .bind(&conditional.template_id)
        .bind(conditional.cancel_pending)
        .bind(conditional.priority)
        .bind(conditional.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_enabled_for_trigger(&self, trigger: EventKind) -> Result<Vec<ConditionalEmail>> {
        let rows = sqlx::query(
            "SELECT id, name, trigger_event, trigger_step, delay_hours, template_id, \
                    cancel_pending, priority, enabled \
             FROM conditional_emails \
             WHERE enabled = TRUE AND trigger_event = $1 \
             ORDER BY priority DESC",
        )
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw_trigger: String = row.get("trigger_event");
                Ok(ConditionalEmail {
                    id: row.get("id"),
                    name: row.get("name"),
                    trigger_event: EventKind::from_gateway(&raw_trigger).ok_or_else(|| {
                        StoreError::Conflict(format!("unknown trigger {raw_trigger}"))
                    })?,
                    trigger_step: row.get("trigger_step"),
                    delay_hours: row.get("delay_hours"),
                    template_id: row.get("template_id"),
                    cancel_pending: row.get("cancel_pending"),
                    priority: row.get("priority"),
                    enabled: row.get("enabled"),
                })
            })
            .collect()
    }

    async fn link_job(
        &self,
        conditional_id: Uuid,
        lead_id: Uuid,
        email_job_id: Uuid,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO conditional_email_jobs
                (conditional_email_id, lead_id, email_job_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (conditional_email_id, lead_id) DO NOTHING
            "#,
        )
        .bind(conditional_id)
        .bind(lead_id)
        .bind(email_job_id)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_linked(&self, conditional_id: Uuid, lead_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS ( \
                SELECT 1 FROM conditional_email_jobs \
                WHERE conditional_email_id = $1 AND lead_id = $2 \
             ) AS linked",
        )
        .bind(conditional_id)
        .bind(lead_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<bool, _>("linked"))
    }
}

#[async_trait]
impl TemplateRepository for PostgresStore {
    async fn get(&self, id: &str) -> Result<Option<EmailTemplate>> {
        let row = sqlx::query(
            "SELECT id, name, subject, html_content FROM email_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| EmailTemplate {
            id: row.get("id"),
            name: row.get("name"),
            subject: row.get("subject"),
            html_content: row.get("html_content"),
        }))
    }

    async fn upsert(&self, template: &EmailTemplate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_templates (id, name, subject, html_content)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET name = $2, subject = $3, html_content = $4
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.html_content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ManualMailRepository for PostgresStore {
    async fn record(&self, mail: &ManualMail) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_mails
                (id, email_job_id, lead_id, email, template_id, status, sent_at, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (email_job_id) DO UPDATE
            SET status = $6, sent_at = $7, error = $8
            "#,
        )
        .bind(mail.id)
        .bind(mail.email_job_id)
        .bind(mail.lead_id)
        .bind(&mail.email)
        .bind(&mail.template_id)
        .bind(mail.status.as_str())
        .bind(opt_millis(mail.sent_at))
        .bind(&mail.error)
        .bind(millis(mail.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_for_job(&self, email_job_id: Uuid) -> Result<Option<ManualMail>> {
        let row = sqlx::query(
            "SELECT id, email_job_id, lead_id, email, template_id, status, sent_at, error, \
                    created_at \
             FROM manual_mails WHERE email_job_id = $1",
        )
        .bind(email_job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ManualMail {
                id: row.get("id"),
                email_job_id: row.get("email_job_id"),
                lead_id: row.get("lead_id"),
                email: row.get("email"),
                template_id: row.get("template_id"),
                status: parse_status(&row.get::<String, _>("status"))?,
                sent_at: from_opt_millis(row.get("sent_at"))?,
                error: row.get("error"),
                created_at: from_millis(row.get("created_at"))?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl NotificationRepository for PostgresStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, lead_id, kind, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(notification.id)
        .bind(notification.lead_id)
        .bind(&notification.kind)
        .bind(&notification.message)
        .bind(millis(notification.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_lead(&self, lead_id: Uuid) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, lead_id, kind, message, created_at \
             FROM notifications WHERE lead_id = $1 ORDER BY created_at DESC",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Notification {
                    id: row.get("id"),
                    lead_id: row.get("lead_id"),
                    kind: row.get("kind"),
                    message: row.get("message"),
                    created_at: from_millis(row.get("created_at"))?,
                })
            })
            .collect()
    }
}
