use std::time::Duration;

use crate::error::Error;

/// Convert a duration to an **exact** multiple of some base duration, or
/// error if round off would be required.
///
/// Used by providers that must render a timeout as an integer count of a
/// fixed unit (e.g. milliseconds in a PostgreSQL connection string).
pub fn to_round_duration(duration: Duration, base: Duration) -> Result<i64, Error> {
    let duration_nanos = duration.as_nanos();
    let base_nanos = base.as_nanos();
    if base_nanos == 0 || duration_nanos % base_nanos != 0 {
        return Err(Error::DurationConversion { duration, base });
    }

    i64::try_from(duration_nanos / base_nanos)
        .map_err(|_| Error::DurationConversion { duration, base })
}
