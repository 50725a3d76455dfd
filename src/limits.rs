//! Hard input limits, enforced before anything is written.

use crate::model::Ms;

/// Facility, room, and user names.
pub const MAX_NAME_LEN: usize = 128;

pub const MAX_TAGS_PER_ROOM: usize = 32;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_FLAG_LEN: usize = 512;

pub const MAX_ROOMS_PER_TENANT: usize = 4_096;
pub const MAX_BOOKINGS_PER_TENANT: usize = 200_000;

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// Timestamps must fall in [1970, 2100).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
