/// Max length of the free-text notes on an appointment.
pub const MAX_NOTES_LEN: usize = 2_000;

/// Max length of a cached patient/provider display name.
pub const MAX_NAME_LEN: usize = 256;

/// Max appointments (any status) stored for a single clinic day.
pub const MAX_APPOINTMENTS_PER_DAY: usize = 2_000;

/// Max number of clinics served by one process.
pub const MAX_CLINICS: usize = 64;

/// Max length of the clinic name taken from the `X-Clinic` header.
pub const MAX_CLINIC_NAME_LEN: usize = 128;

/// Max cabinets a clinic can be configured with.
pub const MAX_CABINETS: u8 = 32;

/// Max attempts to pin an appointment's day while it is being moved concurrently.
pub const MAX_RELOCK_ATTEMPTS: usize = 8;
