//! Hard bounds. Everything a client can grow without bound gets a ceiling.

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_EXPERTS_PER_TENANT: usize = 10_000;

pub const MAX_OVERRIDES_PER_EXPERT: usize = 366;
pub const MAX_SLOTS_PER_DAY: usize = 96;
pub const MAX_CLAIMS_PER_SLOT: usize = 128;
pub const MAX_RANGES_PER_WEEKDAY: usize = 48;
pub const MAX_BLOCKED_DATES: usize = 366;

pub const MAX_MESSAGE_LEN: usize = 2048;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
