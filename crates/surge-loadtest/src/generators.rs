//! Randomized workload values: identities, bank details and request parameters.
//!
//! Every generator takes the caller's random source so a seeded virtual user
//! produces the same request stream on every run.

use std::time::Duration;

use rand::Rng;

const FIRST_NAMES: [&str; 10] = [
    "Alice", "Bob", "Charlie", "Diana", "Eva", "Frank", "Grace", "Henry", "Ivy", "Jack",
];

const ACCOUNT_FIRST_NAMES: [&str; 5] = ["Ahmad", "Budi", "Citra", "Dewi", "Eko"];
const ACCOUNT_LAST_NAMES: [&str; 5] = ["Santoso", "Wijaya", "Putri", "Sari", "Pratama"];

/// Page sizes requested from paginated listings
pub const PAGE_LIMITS: [u32; 3] = [5, 10, 20];

/// Investment amounts offered by the target's products
pub const INVESTMENT_AMOUNTS: [u64; 3] = [1_000, 5_000, 10_000];

fn pick<'a, T, R: Rng + ?Sized>(rng: &mut R, items: &'a [T]) -> &'a T {
    &items[rng.gen_range(0..items.len())]
}

/// Local mobile number: `81` followed by nine digits.
pub fn phone_number<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("81{}", rng.gen_range(100_000_000u64..1_000_000_000))
}

/// Display name with a numeric suffix, e.g. `Grace417`.
pub fn display_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{}{}", pick(rng, &FIRST_NAMES), rng.gen_range(0..1000))
}

/// Ten-digit bank account number.
pub fn account_number<R: Rng + ?Sized>(rng: &mut R) -> String {
    rng.gen_range(1_000_000_000u64..10_000_000_000).to_string()
}

/// Account holder name, `First Last`.
pub fn account_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "{} {}",
        pick(rng, &ACCOUNT_FIRST_NAMES),
        pick(rng, &ACCOUNT_LAST_NAMES)
    )
}

/// Invoice reference used by the payment lookup, `INV-` plus ten digits.
pub fn invoice_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("INV-{}", rng.gen_range(1_000_000_000u64..10_000_000_000))
}

/// Bank identifier in `1..=10`.
pub fn bank_id<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(1..=10)
}

/// Product identifier in `1..=5`.
pub fn product_id<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(1..=5)
}

/// One of [`INVESTMENT_AMOUNTS`].
pub fn investment_amount<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    *pick(rng, &INVESTMENT_AMOUNTS)
}

/// Referral tree depth in `1..=3`.
pub fn team_level<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.gen_range(1..=3)
}

/// Pagination parameters for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub page: u32,
}

/// Page size from [`PAGE_LIMITS`], page in `1..=3`.
pub fn pagination<R: Rng + ?Sized>(rng: &mut R) -> Pagination {
    Pagination {
        limit: *pick(rng, &PAGE_LIMITS),
        page: rng.gen_range(1..=3),
    }
}

/// Uniform duration in `[base, base + spread)` seconds.
///
/// Negative or NaN windows yield zero; windows too large for a `Duration`
/// saturate at `Duration::MAX`.
pub fn jitter<R: Rng + ?Sized>(rng: &mut R, base: f64, spread: f64) -> Duration {
    let secs = if spread > 0.0 {
        base + rng.gen::<f64>() * spread
    } else {
        base
    };
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}
