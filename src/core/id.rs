use rand::Rng;

/// Length of a container name in hex characters.
const NAME_LEN: usize = 16;

/// Generate the per-launch container name used for cgroup directories.
pub fn container_name() -> String {
    let mut rng = rand::thread_rng();
    (0..NAME_LEN / 2)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_lowercase_hex_of_fixed_length() {
        let name = container_name();
        assert_eq!(name.len(), NAME_LEN);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn names_differ_between_launches() {
        assert_ne!(container_name(), container_name());
    }
}
