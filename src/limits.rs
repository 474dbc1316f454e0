//! Hard limits on request sizes and identifier spaces.

/// Max slots a single booking may span.
pub const MAX_SLOTS_PER_BOOKING: usize = 48;

/// Max length of customer name, email, and phone fields.
pub const MAX_CONTACT_FIELD_LEN: usize = 256;

/// Max length of a promotion code.
pub const MAX_PROMOTION_CODE_LEN: usize = 64;

/// Max length of payment description and redirect URLs.
pub const MAX_PAYMENT_TEXT_LEN: usize = 2048;

/// Decimal digits of the per-date booking sequence (000–999).
pub const BOOKING_SEQUENCE_DIGITS: usize = 3;

/// Sequence numbers available per calendar date.
pub const MAX_BOOKINGS_PER_DATE: u32 = 1000;

/// First order code handed to the payment gateway.
pub const ORDER_CODE_BASE: i64 = 100_000;

/// Upper bound accepted by the gateway for order codes (2^53 - 1).
pub const MAX_ORDER_CODE: i64 = 9_007_199_254_740_991;
