//! Setup Service - Creates the relational schema for the project tracker
//!
//! Responsibilities:
//! - Create the projects table and the three dimension tables
//! - Create the three junction tables with cascade-delete foreign keys
//! - Optionally drop everything first for a clean slate
//!
//! Usage:
//!   cargo run --bin setup
//!   cargo run --bin setup -- --reset

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Parser, Debug)]
#[command(name = "setup", about = "Creates the project tracker schema in Postgres")]
struct Args {
    /// Drop all tables before recreating them
    #[arg(long, default_value = "false")]
    reset: bool,
}

/// Creation order matters: junction tables reference the others.
const SCHEMA_STATEMENTS: &[(&str, &str)] = &[
    (
        "projects",
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            project_id TEXT PRIMARY KEY,
            project_title TEXT,
            paas_code TEXT,
            approval_status TEXT,
            fund TEXT,
            pag_value DOUBLE PRECISION NOT NULL DEFAULT 0,
            start_date DATE,
            end_date DATE,
            lead_org_unit TEXT,
            total_expenditure DOUBLE PRECISION NOT NULL DEFAULT 0,
            total_contribution DOUBLE PRECISION NOT NULL DEFAULT 0,
            total_psc DOUBLE PRECISION NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "countries",
        "CREATE TABLE IF NOT EXISTS countries (country_name TEXT PRIMARY KEY)",
    ),
    (
        "themes",
        "CREATE TABLE IF NOT EXISTS themes (theme_name TEXT PRIMARY KEY)",
    ),
    (
        "donors",
        "CREATE TABLE IF NOT EXISTS donors (donor_name TEXT PRIMARY KEY)",
    ),
    (
        "project_countries",
        r#"
        CREATE TABLE IF NOT EXISTS project_countries (
            project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
            country_name TEXT NOT NULL REFERENCES countries(country_name) ON DELETE CASCADE,
            PRIMARY KEY (project_id, country_name)
        )
        "#,
    ),
    (
        "project_themes",
        r#"
        CREATE TABLE IF NOT EXISTS project_themes (
            project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
            theme_name TEXT NOT NULL REFERENCES themes(theme_name) ON DELETE CASCADE,
            PRIMARY KEY (project_id, theme_name)
        )
        "#,
    ),
    (
        "project_donors",
        r#"
        CREATE TABLE IF NOT EXISTS project_donors (
            project_id TEXT NOT NULL REFERENCES projects(project_id) ON DELETE CASCADE,
            donor_name TEXT NOT NULL REFERENCES donors(donor_name) ON DELETE CASCADE,
            PRIMARY KEY (project_id, donor_name)
        )
        "#,
    ),
];

/// Junctions first, then the tables they reference.
const DROP_ORDER: &[&str] = &[
    "project_donors",
    "project_themes",
    "project_countries",
    "donors",
    "themes",
    "countries",
    "projects",
];

async fn drop_schema(pool: &PgPool) -> Result<()> {
    for table in DROP_ORDER {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(pool)
            .await
            .with_context(|| format!("failed to drop table {}", table))?;
        println!("Dropped:  {}", table);
    }
    Ok(())
}

async fn create_schema(pool: &PgPool) -> Result<()> {
    for (table, statement) in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create table {}", table))?;
        println!("Created:  {}", table);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    println!("=== Project Tracker Setup ===");
    println!("Mode: {}", if args.reset { "reset" } else { "create" });

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    if args.reset {
        drop_schema(&pool).await?;
    }
    create_schema(&pool).await?;

    println!("\nSchema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_order_covers_every_created_table() {
        for (table, _) in SCHEMA_STATEMENTS {
            assert!(DROP_ORDER.contains(table), "no drop entry for {}", table);
        }
        assert_eq!(DROP_ORDER.len(), SCHEMA_STATEMENTS.len());
    }

    #[test]
    fn test_junctions_drop_before_their_targets() {
        let position = |table: &str| {
            DROP_ORDER
                .iter()
                .position(|t| *t == table)
                .expect("table missing from drop order")
        };
        for junction in ["project_countries", "project_themes", "project_donors"] {
            assert!(position(junction) < position("projects"));
        }
        assert!(position("project_countries") < position("countries"));
        assert!(position("project_themes") < position("themes"));
        assert!(position("project_donors") < position("donors"));
    }

    #[test]
    fn test_junction_tables_cascade_on_project_delete() {
        for (table, statement) in SCHEMA_STATEMENTS {
            if table.starts_with("project_") {
                assert!(
                    statement.contains("REFERENCES projects(project_id) ON DELETE CASCADE"),
                    "{} must cascade from projects",
                    table
                );
            }
        }
    }
}
