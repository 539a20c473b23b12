
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

/// Saturating conversion for durations that go on the wire as u32 / u64 milliseconds
pub trait MillisCast {
    fn as_millis_u32(&self) -> u32;
    fn as_millis_u64(&self) -> u64;
}
impl MillisCast for std::time::Duration {
    fn as_millis_u32(&self) -> u32 {
        self.as_millis().try_into().unwrap_or(u32::MAX)
    }

    fn as_millis_u64(&self) -> u64 {
        self.as_millis().try_into().unwrap_or(u64::MAX)
    }
}
