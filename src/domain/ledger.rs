use super::TokenAmount;

/// Raw counters gathered from the store for integrity verification.
#[derive(Debug, Clone, Default)]
pub struct IntegrityStats {
    pub wallet_count: i64,
    pub transfer_count: i64,
    pub invalid_wallet_refs: i64,
    /// Transfer rows whose amount is not a positive integer
    pub invalid_amounts: i64,
    /// Wallet rows whose balance is not a non-negative integer
    pub invalid_balances: i64,
}

/// Result of an integrity check over the whole ledger.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub wallet_count: i64,
    pub transfer_count: i64,
    /// Exact sum of every wallet balance
    pub total_supply: TokenAmount,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn build_integrity_report(
    stats: &IntegrityStats,
    total_supply: TokenAmount,
) -> IntegrityReport {
    let mut issues = Vec::new();

    if stats.invalid_wallet_refs > 0 {
        issues.push(format!(
            "{} transfer(s) reference a wallet that does not exist",
            stats.invalid_wallet_refs
        ));
    }
    if stats.invalid_amounts > 0 {
        issues.push(format!(
            "{} transfer(s) have a non-positive or malformed amount",
            stats.invalid_amounts
        ));
    }
    if stats.invalid_balances > 0 {
        issues.push(format!(
            "{} wallet(s) have a negative or malformed balance",
            stats.invalid_balances
        ));
    }

    IntegrityReport {
        wallet_count: stats.wallet_count,
        transfer_count: stats.transfer_count,
        total_supply,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_stats_produce_healthy_report() {
        let stats = IntegrityStats {
            wallet_count: 3,
            transfer_count: 2,
            ..Default::default()
        };

        let report = build_integrity_report(&stats, TokenAmount::from(1_000_000));
        assert!(report.is_healthy());
        assert_eq!(report.wallet_count, 3);
        assert_eq!(report.total_supply.to_string(), "1000000");
    }

    #[test]
    fn test_every_problem_is_reported() {
        let stats = IntegrityStats {
            wallet_count: 3,
            transfer_count: 4,
            invalid_wallet_refs: 1,
            invalid_amounts: 2,
            invalid_balances: 1,
        };

        let report = build_integrity_report(&stats, TokenAmount::default());
        assert!(!report.is_healthy());
        assert_eq!(report.issues.len(), 3);
        assert!(report.issues[0].starts_with("1 transfer(s)"));
    }
}
