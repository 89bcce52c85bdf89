use std::sync::Mutex;

use ulid::Generator;

static GENERATOR: Mutex<Option<Generator>> = Mutex::new(None);

/// Issue a new 26-character ULID.
///
/// IDs from one process are strictly monotonic, so `ORDER BY id` and
/// `ORDER BY created_at` agree for records issued here.
pub fn new_id() -> String {
    let mut guard = match GENERATOR.lock() {
        Ok(guard) => guard,
        // A poisoned generator only ever holds a previous timestamp; keep going.
        Err(poisoned) => poisoned.into_inner(),
    };
    let generator = guard.get_or_insert_with(Generator::new);
    match generator.generate() {
        Ok(ulid) => ulid.to_string(),
        // Random component overflowed within one millisecond; start fresh.
        Err(_) => {
            *generator = Generator::new();
            ulid::Ulid::new().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_ulid_shaped() {
        let id = new_id();
        assert_eq!(id.len(), 26);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_are_monotonic() {
        let ids: Vec<String> = (0..100).map(|_| new_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
