use crate::error::BankError;
use serde::{Deserialize, Serialize};

/// A single loan row.
///
/// The interest rate is fixed at creation and never recomputed, even when
/// the borrower's risk profile changes later; repricing happens only through
/// new quotes on new loans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub id: i64,
    /// Lower-cased entity name; see [`normalize_name`].
    pub name: String,
    /// Principal in dragons.
    pub amount: f64,
    pub interest_rate_percent: f64,
    pub repaid_amount: f64,
    pub loan_open: bool,
}

impl LoanRecord {
    pub fn is_closed(&self) -> bool {
        !self.loan_open
    }
}

/// Case normalization applied to every entity name entering the ledger.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// In-memory loan table: the authoritative copy of ledger state.
///
/// Ids are assigned by the book, strictly increasing, and rows keep
/// insertion order so by-name reads come back in ascending id order. Durable
/// backends mirror rows around `build_row`/`commit_row` so a storage failure
/// never leaves the in-memory copy ahead of disk.
#[derive(Debug, Clone)]
pub struct LoanBook {
    rows: Vec<LoanRecord>,
    next_id: i64,
}

impl Default for LoanBook {
    fn default() -> Self {
        Self::new()
    }
}

impl LoanBook {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted rows; id assignment continues above the
    /// highest id seen. Rows must arrive in ascending id order.
    pub fn from_rows(rows: Vec<LoanRecord>) -> Result<Self, BankError> {
        let mut book = Self::new();
        for row in rows {
            if row.id < book.next_id {
                return Err(BankError::Storage(format!(
                    "persisted loan rows out of order at id {}",
                    row.id
                )));
            }
            book.next_id = row.id + 1;
            book.rows.push(row);
        }
        Ok(book)
    }

    pub fn rows(&self) -> &[LoanRecord] {
        &self.rows
    }

    /// Build the row a create would insert, without committing it.
    pub fn build_row(&self, name: &str, amount: f64, interest_rate_percent: f64) -> LoanRecord {
        LoanRecord {
            id: self.next_id,
            name: normalize_name(name),
            amount,
            interest_rate_percent,
            repaid_amount: 0.0,
            loan_open: true,
        }
    }

    /// Commit a pre-built row after external durability succeeded.
    pub fn commit_row(&mut self, row: LoanRecord) -> Result<(), BankError> {
        if row.id != self.next_id {
            return Err(BankError::Storage(format!(
                "commit id mismatch: expected {}, got {}",
                self.next_id, row.id
            )));
        }
        self.next_id = row.id + 1;
        self.rows.push(row);
        Ok(())
    }

    /// Case-insensitive read, ascending id order.
    pub fn by_name(&self, name: &str) -> Vec<LoanRecord> {
        let name = normalize_name(name);
        self.rows
            .iter()
            .filter(|row| row.name == name)
            .cloned()
            .collect()
    }

    /// Ids of all open records for `name`: the delete set of a cancellation,
    /// computed once and then applied as a whole.
    pub fn open_ids(&self, name: &str) -> Vec<i64> {
        let name = normalize_name(name);
        self.rows
            .iter()
            .filter(|row| row.name == name && row.loan_open)
            .map(|row| row.id)
            .collect()
    }

    pub fn remove_ids(&mut self, ids: &[i64]) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| !ids.contains(&row.id));
        before - self.rows.len()
    }

    pub fn find(&self, id: i64) -> Option<&LoanRecord> {
        self.rows.iter().find(|row| row.id == id)
    }

    pub fn replace(&mut self, updated: LoanRecord) -> Result<(), BankError> {
        let slot = self
            .rows
            .iter_mut()
            .find(|row| row.id == updated.id)
            .ok_or_else(|| BankError::Storage(format!("no loan row with id {}", updated.id)))?;
        *slot = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing_and_unique() {
        let mut book = LoanBook::new();
        let first = book.build_row("Stark", 1000.0, 28.0);
        book.commit_row(first.clone()).unwrap();
        let second = book.build_row("Stark", 500.0, 33.0);
        book.commit_row(second.clone()).unwrap();

        assert!(second.id > first.id);
        assert_eq!(book.by_name("stark").len(), 2);
    }

    #[test]
    fn names_are_lower_cased_on_insert_and_lookup() {
        let mut book = LoanBook::new();
        let row = book.build_row("  House LANNISTER ", 2000.0, 15.0);
        assert_eq!(row.name, "house lannister");
        book.commit_row(row).unwrap();

        assert_eq!(book.by_name("HOUSE Lannister").len(), 1);
    }

    #[test]
    fn commit_rejects_stale_rows() {
        let mut book = LoanBook::new();
        let row = book.build_row("stark", 1000.0, 28.0);
        book.commit_row(row.clone()).unwrap();

        let err = book.commit_row(row).unwrap_err();
        assert!(err.to_string().contains("commit id mismatch"));
    }

    #[test]
    fn open_ids_skips_closed_records() {
        let mut book = LoanBook::new();
        for _ in 0..3 {
            let row = book.build_row("stark", 100.0, 28.0);
            book.commit_row(row).unwrap();
        }
        let mut settled = book.find(2).unwrap().clone();
        settled.loan_open = false;
        settled.repaid_amount = 100.0;
        book.replace(settled).unwrap();

        assert_eq!(book.open_ids("stark"), vec![1, 3]);
    }

    #[test]
    fn from_rows_continues_id_assignment() {
        let mut seed = LoanBook::new();
        for _ in 0..2 {
            let row = seed.build_row("braavos", 100.0, 12.0);
            seed.commit_row(row).unwrap();
        }

        let book = LoanBook::from_rows(seed.rows().to_vec()).unwrap();
        assert_eq!(book.build_row("braavos", 50.0, 12.0).id, 3);
    }

    #[test]
    fn from_rows_rejects_out_of_order_ids() {
        let mut seed = LoanBook::new();
        for _ in 0..2 {
            let row = seed.build_row("braavos", 100.0, 12.0);
            seed.commit_row(row).unwrap();
        }
        let mut rows = seed.rows().to_vec();
        rows.swap(0, 1);

        assert!(LoanBook::from_rows(rows).is_err());
    }
}
