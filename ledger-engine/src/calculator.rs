//! Line-item amount calculator.
//!
//! Pure decimal arithmetic; no rounding happens here. Per-line amounts keep
//! full precision so that summing N lines never drifts from the invoice
//! total.

use anyhow::anyhow;
use ledger_core::error::LedgerError;
use rust_decimal::Decimal;

use crate::models::LineItemInput;

/// Computed amounts for a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineAmounts {
    pub line_total: Decimal,
    pub discount_amount: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Aggregated totals across an invoice's line items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
}

/// Compute amounts for one line.
///
/// `line_total = quantity * unit_price`, discounted by `discount_percent`,
/// then taxed at `tax_rate`. Fails on out-of-range inputs.
pub fn calculate_line(input: &LineItemInput) -> Result<LineAmounts, LedgerError> {
    if input.quantity < Decimal::ZERO {
        return Err(LedgerError::InvalidInput(anyhow!(
            "quantity must not be negative, got {}",
            input.quantity
        )));
    }
    if input.unit_price < Decimal::ZERO {
        return Err(LedgerError::InvalidInput(anyhow!(
            "unit price must not be negative, got {}",
            input.unit_price
        )));
    }
    if input.discount_percent < Decimal::ZERO || input.discount_percent > Decimal::ONE_HUNDRED {
        return Err(LedgerError::InvalidInput(anyhow!(
            "discount percent must be between 0 and 100, got {}",
            input.discount_percent
        )));
    }
    if input.tax_rate < Decimal::ZERO || input.tax_rate > Decimal::ONE_HUNDRED {
        return Err(LedgerError::InvalidInput(anyhow!(
            "tax rate must be between 0 and 100, got {}",
            input.tax_rate
        )));
    }

    let line_total = input.quantity * input.unit_price;
    let discount_amount = line_total * input.discount_percent / Decimal::ONE_HUNDRED;
    let subtotal = line_total - discount_amount;

    // Unreachable given the input bounds above; kept as a hard stop so a
    // negative amount can never reach the invoice.
    if subtotal < Decimal::ZERO {
        return Err(LedgerError::InvalidInput(anyhow!(
            "discount {} exceeds line total {}",
            discount_amount,
            line_total
        )));
    }

    let tax_amount = subtotal * input.tax_rate / Decimal::ONE_HUNDRED;
    let total = subtotal + tax_amount;

    Ok(LineAmounts {
        line_total,
        discount_amount,
        subtotal,
        tax_amount,
        total,
    })
}

/// Sum per-line amounts into invoice totals.
pub fn aggregate_totals(lines: &[LineAmounts]) -> InvoiceTotals {
    let mut totals = InvoiceTotals::default();
    for line in lines {
        totals.subtotal += line.subtotal;
        totals.tax_total += line.tax_amount;
        totals.total += line.total;
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn input(quantity: &str, unit_price: &str, discount: &str, tax: &str) -> LineItemInput {
        LineItemInput {
            description: "Test item".to_string(),
            quantity: dec(quantity),
            unit_price: dec(unit_price),
            discount_percent: dec(discount),
            tax_rate: dec(tax),
            sort_order: 0,
        }
    }

    #[test]
    fn discounted_taxed_line() {
        // qty=10, price=25.00, discount=10%, tax=13%
        let amounts = calculate_line(&input("10", "25.00", "10", "13")).unwrap();
        assert_eq!(amounts.line_total, dec("250.00"));
        assert_eq!(amounts.discount_amount, dec("25.000"));
        assert_eq!(amounts.subtotal, dec("225.00"));
        assert_eq!(amounts.tax_amount, dec("29.25"));
        assert_eq!(amounts.total, dec("254.25"));
    }

    #[test]
    fn zero_discount_default() {
        let amounts = calculate_line(&input("2.5", "100.00", "0", "0")).unwrap();
        assert_eq!(amounts.subtotal, dec("250.00"));
        assert_eq!(amounts.total, dec("250.00"));
    }

    #[test]
    fn total_is_subtotal_plus_tax() {
        let amounts = calculate_line(&input("3", "19.99", "5", "7.25")).unwrap();
        assert_eq!(amounts.total, amounts.subtotal + amounts.tax_amount);
        assert_eq!(amounts.subtotal, amounts.line_total - amounts.discount_amount);
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        assert!(calculate_line(&input("-1", "10", "0", "0")).is_err());
        assert!(calculate_line(&input("1", "-10", "0", "0")).is_err());
        assert!(calculate_line(&input("1", "10", "101", "0")).is_err());
        assert!(calculate_line(&input("1", "10", "-1", "0")).is_err());
        assert!(calculate_line(&input("1", "10", "0", "100.5")).is_err());
    }

    #[test]
    fn aggregation_matches_per_line_sums() {
        let lines = vec![
            calculate_line(&input("10", "25.00", "10", "13")).unwrap(),
            calculate_line(&input("1", "0.01", "0", "13")).unwrap(),
            calculate_line(&input("7", "3.33", "50", "8.875")).unwrap(),
        ];
        let totals = aggregate_totals(&lines);
        let subtotal: Decimal = lines.iter().map(|l| l.subtotal).sum();
        let tax: Decimal = lines.iter().map(|l| l.tax_amount).sum();
        assert_eq!(totals.subtotal, subtotal);
        assert_eq!(totals.tax_total, tax);
        assert_eq!(totals.total, subtotal + tax);
    }
}
