use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::models::UserContact;

/// Read-only view over the platform's user accounts. The account store
/// itself belongs to another service; this subsystem only resolves
/// recipients and the admin audience.
#[async_trait]
pub trait Directory: Send + Sync {
    /// None when the user does not exist (e.g. an anonymous contact
    /// form submitter).
    async fn user_contact(&self, user_id: &str) -> Result<Option<UserContact>>;

    async fn admins(&self) -> Result<Vec<UserContact>>;
}

pub struct PgDirectory {
    pool: Pool<Postgres>,
}

impl PgDirectory {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn row_to_contact(row: &sqlx::postgres::PgRow) -> Result<UserContact> {
        Ok(UserContact {
            user_id: row.try_get("id")?,
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
        })
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn user_contact(&self, user_id: &str) -> Result<Option<UserContact>> {
        let row = sqlx::query("SELECT id, email, first_name FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_contact).transpose()
    }

    async fn admins(&self) -> Result<Vec<UserContact>> {
        let rows = sqlx::query("SELECT id, email, first_name FROM users WHERE role = 'admin'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_contact).collect()
    }
}

/// In-memory directory for tests and single-process development.
#[derive(Default)]
pub struct MemoryDirectory {
    users: Mutex<HashMap<String, (UserContact, bool)>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, contact: UserContact) {
        self.users
            .lock()
            .unwrap()
            .insert(contact.user_id.clone(), (contact, false));
    }

    pub fn add_admin(&self, contact: UserContact) {
        self.users
            .lock()
            .unwrap()
            .insert(contact.user_id.clone(), (contact, true));
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn user_contact(&self, user_id: &str) -> Result<Option<UserContact>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(user_id)
            .map(|(c, _)| c.clone()))
    }

    async fn admins(&self) -> Result<Vec<UserContact>> {
        let mut admins: Vec<_> = self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|(_, is_admin)| *is_admin)
            .map(|(c, _)| c.clone())
            .collect();
        admins.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(admins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_users_and_admins() {
        let dir = MemoryDirectory::new();
        dir.add_user(UserContact {
            user_id: "u1".into(),
            email: Some("u1@example.com".into()),
            first_name: Some("Ada".into()),
        });
        dir.add_admin(UserContact {
            user_id: "a1".into(),
            email: Some("admin@example.com".into()),
            first_name: None,
        });

        let contact = dir.user_contact("u1").await.unwrap().unwrap();
        assert!(contact.has_email());
        assert!(dir.user_contact("missing").await.unwrap().is_none());

        let admins = dir.admins().await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].user_id, "a1");
    }
}
