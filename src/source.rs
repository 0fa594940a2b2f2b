//! CSV readers for transactions, the district ban list and scoring input

use crate::error::{PipelineError, Result};
use crate::types::{
    AccountFeatureVector, TransactionRecord, TransactionType, NUM_WITHDRAWALS_COLUMN,
    TOTAL_WITHDRAWALS_COLUMN,
};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

const TRANSACTIONS_TABLE: &str = "transactions";
const BANNED_DISTRICTS_TABLE: &str = "banned_districts";
const SCORING_TABLE: &str = "scoring";

const TRANSACTION_COLUMNS: [&str; 4] = ["trans_date", "account_id", "trans_type", "amount"];
const DISTRICT_COLUMN: &str = "district_id";

/// Set of districts whose transactions are excluded from training.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanList {
    districts: HashSet<i64>,
}

impl BanList {
    pub fn new(districts: impl IntoIterator<Item = i64>) -> Self {
        Self {
            districts: districts.into_iter().collect(),
        }
    }

    pub fn is_banned(&self, district_id: i64) -> bool {
        self.districts.contains(&district_id)
    }

    pub fn len(&self) -> usize {
        self.districts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.districts.is_empty()
    }
}

/// Column positions resolved from a header row.
fn require_columns(
    table: &str,
    headers: &csv::StringRecord,
    required: &[&str],
) -> Result<Vec<usize>> {
    let mut positions = Vec::with_capacity(required.len());
    let mut missing = Vec::new();
    for name in required {
        match headers.iter().position(|h| h.trim() == *name) {
            Some(idx) => positions.push(idx),
            None => missing.push(name.to_string()),
        }
    }
    if missing.is_empty() {
        Ok(positions)
    } else {
        Err(PipelineError::Schema {
            table: table.to_string(),
            missing,
        })
    }
}

fn field<'r>(record: &'r csv::StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or_default().trim()
}

fn invalid(table: &str, line: usize, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::InvalidRecord {
        table: table.to_string(),
        reason: format!("line {line}: {reason}"),
    }
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` (a `T` separator is accepted too).
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_number<T: std::str::FromStr>(
    table: &str,
    line: usize,
    column: &str,
    raw: &str,
) -> Result<T> {
    raw.parse()
        .map_err(|_| invalid(table, line, format!("{column} {raw:?} is not a number")))
}

fn parse_amount(table: &str, line: usize, column: &str, raw: &str) -> Result<f64> {
    let value: f64 = parse_number(table, line, column, raw)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(invalid(table, line, format!("{column} must be finite")))
    }
}

/// Read the ban list: one `district_id` per row.
pub fn read_ban_list<R: Read>(reader: R) -> Result<BanList> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| invalid(BANNED_DISTRICTS_TABLE, 1, e))?
        .clone();
    let idx = require_columns(BANNED_DISTRICTS_TABLE, &headers, &[DISTRICT_COLUMN])?[0];

    let mut districts = HashSet::new();
    for (i, record) in rdr.records().enumerate() {
        let line = i + 2;
        let record = record.map_err(|e| invalid(BANNED_DISTRICTS_TABLE, line, e))?;
        districts.insert(parse_number(
            BANNED_DISTRICTS_TABLE,
            line,
            DISTRICT_COLUMN,
            field(&record, idx),
        )?);
    }
    Ok(BanList { districts })
}

/// Read transactions, dropping rows from banned districts.
///
/// A non-empty ban list requires the `district_id` column.
pub fn read_transactions<R: Read>(reader: R, bans: &BanList) -> Result<Vec<TransactionRecord>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| invalid(TRANSACTIONS_TABLE, 1, e))?
        .clone();

    let mut required = TRANSACTION_COLUMNS.to_vec();
    if !bans.is_empty() {
        required.push(DISTRICT_COLUMN);
    }
    let positions = require_columns(TRANSACTIONS_TABLE, &headers, &required)?;
    let (date_idx, account_idx, type_idx, amount_idx) =
        (positions[0], positions[1], positions[2], positions[3]);
    let district_idx = positions.get(4).copied();

    let mut records = Vec::new();
    let mut banned = 0usize;
    for (i, record) in rdr.records().enumerate() {
        let line = i + 2;
        let record = record.map_err(|e| invalid(TRANSACTIONS_TABLE, line, e))?;

        if let Some(idx) = district_idx {
            let district: i64 =
                parse_number(TRANSACTIONS_TABLE, line, DISTRICT_COLUMN, field(&record, idx))?;
            if bans.is_banned(district) {
                banned += 1;
                continue;
            }
        }

        let raw_date = field(&record, date_idx);
        let date = parse_date(raw_date)
            .ok_or_else(|| invalid(TRANSACTIONS_TABLE, line, format!("bad date {raw_date:?}")))?;
        let account_id =
            parse_number(TRANSACTIONS_TABLE, line, "account_id", field(&record, account_idx))?;
        let trans_type = TransactionType::from_code(field(&record, type_idx));
        let amount = parse_amount(TRANSACTIONS_TABLE, line, "amount", field(&record, amount_idx))?;

        records.push(TransactionRecord::new(date, account_id, trans_type, amount));
    }

    if records.is_empty() {
        warn!(banned = banned, "Transaction table produced no rows");
    }
    info!(rows = records.len(), banned = banned, "Transactions loaded");
    Ok(records)
}

/// Read scoring rows, keeping at most `limit` when given.
pub fn read_scoring_rows<R: Read>(
    reader: R,
    limit: Option<usize>,
) -> Result<Vec<AccountFeatureVector>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr
        .headers()
        .map_err(|e| invalid(SCORING_TABLE, 1, e))?
        .clone();
    let positions = require_columns(
        SCORING_TABLE,
        &headers,
        &["account_id", NUM_WITHDRAWALS_COLUMN, TOTAL_WITHDRAWALS_COLUMN],
    )?;

    let mut rows = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        if limit.is_some_and(|limit| rows.len() >= limit) {
            break;
        }
        let line = i + 2;
        let record = record.map_err(|e| invalid(SCORING_TABLE, line, e))?;
        rows.push(AccountFeatureVector::new(
            parse_number(SCORING_TABLE, line, "account_id", field(&record, positions[0]))?,
            parse_amount(SCORING_TABLE, line, NUM_WITHDRAWALS_COLUMN, field(&record, positions[1]))?,
            parse_amount(SCORING_TABLE, line, TOTAL_WITHDRAWALS_COLUMN, field(&record, positions[2]))?,
        ));
    }

    info!(rows = rows.len(), limit = ?limit, "Scoring rows loaded");
    Ok(rows)
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| PipelineError::io(path.display().to_string(), e))
}

pub fn load_ban_list(path: &Path) -> Result<BanList> {
    read_ban_list(open(path)?)
}

pub fn load_transactions(path: &Path, bans: &BanList) -> Result<Vec<TransactionRecord>> {
    read_transactions(open(path)?, bans)
}

pub fn load_scoring_rows(path: &Path, limit: Option<usize>) -> Result<Vec<AccountFeatureVector>> {
    read_scoring_rows(open(path)?, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TRANSACTIONS: &str = "\
trans_date,account_id,trans_type,amount,district_id
1995-03-24,1,C,1000.0,18
1995-04-13,1,D,-3679.0,18
1995-04-23 12:30:00,2,D,-200.5,7
1995-05-01,3,P,-14.6,1
";

    #[test]
    fn test_reads_and_maps_types() {
        let records = read_transactions(TRANSACTIONS.as_bytes(), &BanList::default()).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].trans_type, TransactionType::Credit);
        assert_eq!(records[1].trans_type, TransactionType::Withdrawal);
        assert_eq!(records[3].trans_type, TransactionType::Other);
        assert_eq!(records[2].date, parse_date("1995-04-23 12:30:00").unwrap());
        assert_eq!(records[1].amount, -3679.0);
    }

    #[test]
    fn test_banned_districts_are_dropped() {
        let bans = read_ban_list("district_id\n7\n1\n".as_bytes()).unwrap();
        assert_eq!(bans.len(), 2);

        let records = read_transactions(TRANSACTIONS.as_bytes(), &bans).unwrap();
        let accounts: Vec<u64> = records.iter().map(|r| r.account_id).collect();
        assert_eq!(accounts, vec![1, 1]);
    }

    #[test]
    fn test_missing_columns_are_a_schema_error() {
        let err = read_transactions("trans_date,account_id\n1995-01-01,1\n".as_bytes(), &BanList::default())
            .unwrap_err();
        match err {
            PipelineError::Schema { table, missing } => {
                assert_eq!(table, "transactions");
                assert_eq!(missing, vec!["trans_type".to_string(), "amount".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_ban_list_needs_district_column() {
        let bans = BanList::new([5]);
        let err = read_transactions(
            "trans_date,account_id,trans_type,amount\n1995-01-01,1,D,-5\n".as_bytes(),
            &bans,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn test_bad_values_are_invalid_records() {
        let bad_date = "trans_date,account_id,trans_type,amount\n24/03/1995,1,D,-5\n";
        assert!(matches!(
            read_transactions(bad_date.as_bytes(), &BanList::default()).unwrap_err(),
            PipelineError::InvalidRecord { .. }
        ));

        let nan_amount = "trans_date,account_id,trans_type,amount\n1995-03-24,1,D,NaN\n";
        assert!(matches!(
            read_transactions(nan_amount.as_bytes(), &BanList::default()).unwrap_err(),
            PipelineError::InvalidRecord { .. }
        ));
    }

    #[test]
    fn test_header_only_table_is_empty_not_an_error() {
        let records = read_transactions(
            "trans_date,account_id,trans_type,amount\n".as_bytes(),
            &BanList::default(),
        )
        .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_scoring_rows_with_limit() {
        let csv = "account_id,num_withdrawals_5d,total_withdrawals_5d\n1,3,300\n2,4,400\n3,5,500\n";
        let all = read_scoring_rows(csv.as_bytes(), None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1], AccountFeatureVector::new(2, 4.0, 400.0));

        let limited = read_scoring_rows(csv.as_bytes(), Some(2)).unwrap();
        assert_eq!(limited.len(), 2);

        let err = read_scoring_rows("account_id,total_withdrawals_5d\n".as_bytes(), None).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(TRANSACTIONS.as_bytes()).unwrap();

        let records = load_transactions(file.path(), &BanList::default()).unwrap();
        assert_eq!(records.len(), 4);

        let err = load_ban_list(Path::new("/nonexistent/banned.csv")).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactIo { .. }));
    }

    #[test]
    fn test_date_formats() {
        let midnight = parse_date("1996-07-01").unwrap();
        assert_eq!(midnight.to_string(), "1996-07-01 00:00:00");
        assert!(parse_date("1996-07-01 08:15:00").is_some());
        assert!(parse_date("1996-07-01T08:15:00").is_some());
        assert!(parse_date("07/01/1996").is_none());
    }
}
