//! Synthetic Transaction Generator
//!
//! Writes a transaction table, a district ban list and a scoring table for
//! local pipeline runs.
//!
//! Usage: generate_transactions [out_dir] [accounts] [days] [heavy_rate] [seed]

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

const DISTRICTS: i64 = 77;
const BANNED_DISTRICTS: [i64; 3] = [13, 42, 69];

#[derive(Debug, Serialize)]
struct TransactionRow {
    trans_date: String,
    account_id: u64,
    trans_type: &'static str,
    amount: f64,
    district_id: i64,
}

#[derive(Debug, Serialize)]
struct BannedRow {
    district_id: i64,
}

#[derive(Debug, Serialize)]
struct ScoringRow {
    account_id: u64,
    num_withdrawals_5d: f64,
    total_withdrawals_5d: f64,
}

/// Account activity generator
struct TransactionGenerator {
    rng: StdRng,
    start: NaiveDate,
    days: i64,
}

impl TransactionGenerator {
    fn new(seed: u64, days: i64) -> Result<Self> {
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            start: NaiveDate::from_ymd_opt(1995, 1, 1).context("Invalid start date")?,
            days,
        })
    }

    /// One account's history; heavy accounts withdraw more often and larger sums.
    fn generate_account(&mut self, account_id: u64, heavy: bool) -> Vec<TransactionRow> {
        let district_id = self.rng.gen_range(1..=DISTRICTS);
        let (events, max_amount) = if heavy {
            (self.rng.gen_range(40..120), 20_000.0)
        } else {
            (self.rng.gen_range(5..40), 2_000.0)
        };

        let mut rows: Vec<TransactionRow> = (0..events)
            .map(|_| {
                let date = self.start + Duration::days(self.rng.gen_range(0..self.days));
                let (trans_type, amount) = match self.rng.gen_range(0..10) {
                    0..=2 => ("C", self.rng.gen_range(100.0..5_000.0)),
                    3 => ("P", -self.rng.gen_range(10.0..300.0)),
                    _ => ("D", -self.rng.gen_range(50.0..max_amount)),
                };
                TransactionRow {
                    trans_date: date.format("%Y-%m-%d").to_string(),
                    account_id,
                    trans_type,
                    amount: (amount * 100.0_f64).round() / 100.0,
                    district_id,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.trans_date.cmp(&b.trans_date));
        rows
    }

    fn generate_scoring(&mut self, account_id: u64, heavy: bool) -> ScoringRow {
        let num = self.rng.gen_range(1.0..30.0_f64).round();
        let per_row = if heavy {
            self.rng.gen_range(50_000.0..400_000.0)
        } else {
            self.rng.gen_range(1_000.0..40_000.0)
        };
        ScoringRow {
            account_id,
            num_withdrawals_5d: num,
            total_withdrawals_5d: (num * per_row).round(),
        }
    }
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("generate_transactions=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let out_dir = Path::new(args.get(1).map(|s| s.as_str()).unwrap_or("data"));
    let accounts: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(500);
    let days: i64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(365);
    let heavy_rate: f64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.02);
    let seed: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(42);

    anyhow::ensure!(days > 0, "days must be positive");
    anyhow::ensure!((0.0..=1.0).contains(&heavy_rate), "heavy_rate must be in [0, 1]");

    info!(
        out_dir = %out_dir.display(),
        accounts = accounts,
        days = days,
        heavy_rate = heavy_rate,
        seed = seed,
        "Configuration loaded"
    );

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let mut generator = TransactionGenerator::new(seed, days)?;
    let mut transactions = Vec::new();
    let mut scoring = Vec::new();
    let mut heavy_count = 0;

    for account_id in 1..=accounts {
        let heavy = generator.rng.gen_bool(heavy_rate);
        if heavy {
            heavy_count += 1;
        }
        transactions.extend(generator.generate_account(account_id, heavy));
    }

    // Scoring rows mix known accounts with ones never seen in training
    for account_id in (1..=accounts).step_by(10).chain(accounts + 1..=accounts + 20) {
        let heavy = generator.rng.gen_bool(heavy_rate);
        scoring.push(generator.generate_scoring(account_id, heavy));
    }

    let banned: Vec<BannedRow> = BANNED_DISTRICTS
        .iter()
        .map(|&district_id| BannedRow { district_id })
        .collect();

    write_csv(&out_dir.join("transactions.csv"), &transactions)?;
    write_csv(&out_dir.join("banned_districts.csv"), &banned)?;
    write_csv(&out_dir.join("withdrawals_test.csv"), &scoring)?;

    info!(
        transactions = transactions.len(),
        heavy_accounts = heavy_count,
        scoring_rows = scoring.len(),
        "Completed! Synthetic data written"
    );

    Ok(())
}
