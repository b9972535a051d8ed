use std::env;

use coordination_store::migrate::{MigrationJournal, Migrator, StepOutcome};
use coordination_store::{SchemaConfig, StoreError};
use db_pool::DbConfig;
use sqlx::PgPool;

const DEFAULT_JOURNAL: &str = "migration-journal.json";

fn usage() {
    eprintln!("Usage:");
    eprintln!("  migrate init [journal_path]");
    eprintln!("  migrate step [journal_path]");
    eprintln!("  migrate resume [journal_path]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  DATABASE_URL     Postgres connection string (step/resume)");
    eprintln!("  WH_TABLE_PREFIX  Infrastructure table prefix (default wh_)");
}

fn exit_code(err: &StoreError) -> i32 {
    match err {
        StoreError::Journal(_) => 1,
        _ => 2,
    }
}

async fn connect() -> Result<PgPool, i32> {
    let config = match DbConfig::from_env("migrate") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return Err(1);
        }
    };
    db_pool::create_pool(&config).await.map_err(|e| {
        eprintln!("Failed to connect to database: {}", e);
        2
    })
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let schema = match env::var("WH_TABLE_PREFIX") {
        Ok(prefix) => SchemaConfig::with_prefix(prefix),
        Err(_) => SchemaConfig::default(),
    };
    let journal_path = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_JOURNAL.to_string());
    let migrator = Migrator::new(schema, &journal_path);

    let code = match args[1].as_str() {
        "init" => match migrator.init() {
            Ok(journal) => {
                println!(
                    "Initialized journal {} with {} transformations",
                    journal_path,
                    journal.transformations.len()
                );
                0
            }
            Err(e) => {
                eprintln!("{}", e);
                exit_code(&e)
            }
        },
        "step" => match connect().await {
            Ok(pool) => match migrator.step(&pool).await {
                Ok(StepOutcome::Applied(name)) => {
                    println!("Applied {}", name);
                    0
                }
                Ok(StepOutcome::Finished(name)) => {
                    println!("Applied {} (migration complete)", name);
                    0
                }
                Ok(StepOutcome::AlreadyComplete) => {
                    println!("Migration already complete");
                    0
                }
                Err(e) => {
                    eprintln!("{}", e);
                    exit_code(&e)
                }
            },
            Err(code) => code,
        },
        "resume" => match connect().await {
            Ok(pool) => match migrator.resume(&pool).await {
                Ok(applied) => {
                    let status = MigrationJournal::load(migrator.journal_path())
                        .map(|j| j.status)
                        .ok();
                    println!("Applied {} statements (status: {:?})", applied, status);
                    0
                }
                Err(e) => {
                    eprintln!("{}", e);
                    exit_code(&e)
                }
            },
            Err(code) => code,
        },
        _ => {
            usage();
            1
        }
    };

    std::process::exit(code);
}
