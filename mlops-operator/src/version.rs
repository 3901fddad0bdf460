use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use clippy_utilities::OverflowArithmetic;

/// Alphabet of the base-36 encoding
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Last issued millisecond, keeps versions strictly increasing per process
static LAST_ISSUED: Mutex<u64> = Mutex::new(0);

/// Encode `number` in base-36, left-padded to at least `digits` characters
fn dec_to_base36(mut number: u64, digits: usize) -> String {
    let mut encoded = Vec::new();
    while number > 0 || encoded.len() < digits {
        encoded.push(BASE36[(number % 36) as usize]);
        number /= 36;
    }
    encoded.reverse();
    String::from_utf8(encoded).unwrap_or_default()
}

/// Short version suffix derived from wall-clock time: seconds and the
/// millisecond fraction, both base-36. Successive calls within one process
/// are strictly increasing under lexicographic order; uniqueness across
/// restarts is ultimately enforced by object names in the cluster store.
pub(crate) fn get_version() -> String {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    let mut last = LAST_ISSUED
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let millis = wall.max(last.overflow_add(1));
    *last = millis;
    format!(
        "{}-{}",
        dec_to_base36(millis / 1000, 4),
        dec_to_base36(millis % 1000, 2)
    )
}

#[cfg(test)]
mod test {
    use super::{dec_to_base36, get_version};

    #[test]
    fn test_base36_encoding() {
        assert_eq!(dec_to_base36(0, 4), "0000");
        assert_eq!(dec_to_base36(35, 2), "0z");
        assert_eq!(dec_to_base36(36, 2), "10");
        assert_eq!(dec_to_base36(1295, 2), "zz");
        assert_eq!(dec_to_base36(1296, 2), "100");
        // no truncation above the pad width
        assert_eq!(dec_to_base36(36 * 36 * 36 * 36, 4), "10000");
    }

    #[test]
    fn test_version_format() {
        let version = get_version();
        let (seconds, fraction) = version.split_once('-').unwrap();
        assert!(seconds.len() >= 4);
        assert!(fraction.len() >= 2);
        assert!(version
            .chars()
            .all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_versions_strictly_increase() {
        let mut versions: Vec<String> = (0..64).map(|_| get_version()).collect();
        let issued = versions.clone();
        versions.sort();
        versions.dedup();
        assert_eq!(issued, versions);
    }
}
