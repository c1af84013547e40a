//! Domain queries.

use hostpanel_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::Domain;

impl Database {
    /// Register a domain. Fails with `AlreadyExists` on a duplicate name.
    pub async fn create_domain(
        &self,
        domain: &str,
        provider: Option<&str>,
    ) -> Result<Domain, DatabaseError> {
        let now = unix_timestamp();

        let id = sqlx::query(
            r"
            INSERT INTO domains (domain, domain_provider, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(domain)
        .bind(provider)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| DatabaseError::on_write(e, &format!("domain {domain}")))?
        .last_insert_rowid();

        self.get_domain(id).await
    }

    /// Get a domain by ID.
    pub async fn get_domain(&self, id: i64) -> Result<Domain, DatabaseError> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Domain {id}")))
    }

    /// Get a domain by its hostname.
    pub async fn get_domain_by_name(&self, domain: &str) -> Result<Domain, DatabaseError> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE domain = ?")
            .bind(domain)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Domain {domain}")))
    }

    /// List all domains, alphabetically.
    pub async fn list_domains(&self) -> Result<Vec<Domain>, DatabaseError> {
        let domains = sqlx::query_as::<_, Domain>("SELECT * FROM domains ORDER BY domain")
            .fetch_all(self.pool())
            .await?;
        Ok(domains)
    }

    /// Update registrar metadata.
    pub async fn set_domain_provider(
        &self,
        domain: &str,
        provider: Option<&str>,
    ) -> Result<Domain, DatabaseError> {
        let result =
            sqlx::query("UPDATE domains SET domain_provider = ?, updated_at = ? WHERE domain = ?")
                .bind(provider)
                .bind(unix_timestamp())
                .bind(domain)
                .execute(self.pool())
                .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Domain {domain}")));
        }
        self.get_domain_by_name(domain).await
    }

    /// Record when the domain's certificate was last issued or renewed.
    pub async fn record_ssl_renewal(&self, domain: &str, at: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE domains SET ssl_renewed_at = ?, updated_at = ? WHERE domain = ?")
            .bind(at)
            .bind(unix_timestamp())
            .bind(domain)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Delete a domain. Fails with `StillReferenced` while a project uses it.
    pub async fn delete_domain(&self, domain: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM domains WHERE domain = ?")
            .bind(domain)
            .execute(self.pool())
            .await
            .map_err(|e| DatabaseError::on_delete(e, &format!("domain {domain}")))?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Domain {domain}")));
        }
        Ok(())
    }
}
