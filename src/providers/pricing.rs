use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_m: Decimal,
    pub output_per_m: Decimal,
}

/// Per-model pricing table (USD per 1M tokens).
///
/// More-specific patterns must come before less-specific ones because the
/// match uses `contains`: "flash-lite" must precede "flash". Unknown
/// models fall through to a conservative default so a mislabeled model
/// over-counts cost rather than under-counting it.
pub fn model_pricing(provider: &str, model: &str) -> ModelPricing {
    let d = |s: &str| Decimal::from_str(s).unwrap();

    match (provider, model) {
        // ── Gemini ────────────────────────────────────────────────
        ("gemini", m) if m.contains("flash-lite") => ModelPricing {
            input_per_m: d("0.075"),
            output_per_m: d("0.30"),
        },
        ("gemini", m) if m.contains("flash") => ModelPricing {
            input_per_m: d("0.10"),
            output_per_m: d("0.40"),
        },
        ("gemini", m) if m.contains("pro") => ModelPricing {
            input_per_m: d("1.25"),
            output_per_m: d("10.00"),
        },

        // ── Claude ────────────────────────────────────────────────
        ("claude", m) if m.contains("haiku") => ModelPricing {
            input_per_m: d("0.80"),
            output_per_m: d("4.00"),
        },
        ("claude", m) if m.contains("sonnet") => ModelPricing {
            input_per_m: d("3.00"),
            output_per_m: d("15.00"),
        },
        ("claude", m) if m.contains("opus") => ModelPricing {
            input_per_m: d("15.00"),
            output_per_m: d("75.00"),
        },

        // Conservative default for unknown models
        _ => ModelPricing {
            input_per_m: d("5.00"),
            output_per_m: d("20.00"),
        },
    }
}

/// costUSD = (in × rate_in + out × rate_out) / 1e6, as Decimal.
pub fn cost_usd(provider: &str, model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
    let pricing = model_pricing(provider, model);
    let one_million = Decimal::from(1_000_000);

    let input_cost = (Decimal::from(input_tokens) / one_million) * pricing.input_per_m;
    let output_cost = (Decimal::from(output_tokens) / one_million) * pricing.output_per_m;
    input_cost + output_cost
}
