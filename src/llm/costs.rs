//! Per-model token prices in USD.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Price charged for models missing from the table.
const FALLBACK_RATE: Decimal = dec!(0.00003);

/// (input, output) cost per token for a known model.
pub fn model_cost(model: &str) -> Option<(Decimal, Decimal)> {
    let model = model.rsplit('/').next().unwrap_or(model);
    let rates = match model {
        m if m.starts_with("gpt-4o-mini") => (dec!(0.00000015), dec!(0.0000006)),
        m if m.starts_with("gpt-4o") => (dec!(0.0000025), dec!(0.00001)),
        m if m.starts_with("gpt-4.1-mini") => (dec!(0.0000004), dec!(0.0000016)),
        m if m.starts_with("gpt-4.1") => (dec!(0.000002), dec!(0.000008)),
        m if m.starts_with("gpt-3.5-turbo") => (dec!(0.0000005), dec!(0.0000015)),
        m if m.starts_with("claude-3-5-haiku") => (dec!(0.0000008), dec!(0.000004)),
        m if m.starts_with("claude-sonnet-4") || m.starts_with("claude-3-5-sonnet") => {
            (dec!(0.000003), dec!(0.000015))
        }
        _ => return None,
    };
    Some(rates)
}

/// Rates for unknown models.
pub fn default_cost() -> (Decimal, Decimal) {
    (FALLBACK_RATE, FALLBACK_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_matches_before_full_model() {
        let (input, output) = model_cost("gpt-4o-mini").unwrap();
        assert_eq!(input, dec!(0.00000015));
        assert_eq!(output, dec!(0.0000006));
        assert_eq!(model_cost("gpt-4o").unwrap().0, dec!(0.0000025));
    }

    #[test]
    fn provider_prefix_is_ignored() {
        assert_eq!(model_cost("openai/gpt-4o-mini"), model_cost("gpt-4o-mini"));
    }

    #[test]
    fn unknown_model_has_no_entry() {
        assert!(model_cost("llama-local").is_none());
        assert_eq!(default_cost(), (dec!(0.00003), dec!(0.00003)));
    }
}
