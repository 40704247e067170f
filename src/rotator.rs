use std::sync::Mutex;

use crate::connection_info::ConnectionAddr;

/// Round-robin rotation over the pool's connection targets.
///
/// Every new connection asks for the next target, so consecutive connections
/// spread over all configured addresses.  The list can be swapped at runtime
/// ([`AddressRotator::update`]), which restarts the rotation from the front.
///
/// The rotator is shared between the pool task and connection factory tasks,
/// so the cursor sits behind a mutex; the lock is only held for the copy of
/// one address and never across an await point.
#[derive(Debug)]
pub struct AddressRotator {
    inner: Mutex<RotatorState>,
}

#[derive(Debug)]
struct RotatorState {
    addresses: Vec<ConnectionAddr>,
    cursor: usize,
}

impl AddressRotator {
    /// Creates a rotator over the given targets.
    pub fn new(addresses: Vec<ConnectionAddr>) -> AddressRotator {
        AddressRotator {
            inner: Mutex::new(RotatorState {
                addresses,
                cursor: 0,
            }),
        }
    }

    /// Returns the next target, wrapping at the end of the list.
    /// `None` when no targets are configured; the cursor resets so a later
    /// [`AddressRotator::update`] starts from the front.
    pub fn next_target(&self) -> Option<ConnectionAddr> {
        let mut state = self.inner.lock().unwrap();
        if state.addresses.is_empty() {
            state.cursor = 0;
            return None;
        }
        if state.cursor >= state.addresses.len() {
            state.cursor = 0;
        }
        let addr = state.addresses[state.cursor].clone();
        state.cursor += 1;
        Some(addr)
    }

    /// Replaces the target list and resets the cursor to the start.
    pub fn update(&self, addresses: Vec<ConnectionAddr>) {
        let mut state = self.inner.lock().unwrap();
        state.addresses = addresses;
        state.cursor = 0;
    }

    /// Number of configured targets.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().addresses.len()
    }

    /// True when no targets are configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str) -> ConnectionAddr {
        ConnectionAddr::Tcp(host.to_string(), 6379)
    }

    #[test]
    fn rotates_with_wrap_around() {
        let rotator = AddressRotator::new(vec![tcp("a"), tcp("b"), tcp("c")]);
        let hosts: Vec<_> = (0..7)
            .map(|_| rotator.next_target().unwrap().to_string())
            .collect();
        assert_eq!(
            hosts,
            vec!["a:6379", "b:6379", "c:6379", "a:6379", "b:6379", "c:6379", "a:6379"]
        );
    }

    #[test]
    fn empty_list_yields_none() {
        let rotator = AddressRotator::new(vec![]);
        assert_eq!(rotator.next_target(), None);
        assert!(rotator.is_empty());
    }

    #[test]
    fn update_resets_the_cursor() {
        let rotator = AddressRotator::new(vec![tcp("a"), tcp("b")]);
        rotator.next_target().unwrap();
        rotator.update(vec![tcp("x"), tcp("y")]);
        assert_eq!(rotator.next_target().unwrap().to_string(), "x:6379");
        assert_eq!(rotator.next_target().unwrap().to_string(), "y:6379");
        assert_eq!(rotator.next_target().unwrap().to_string(), "x:6379");
    }

    #[test]
    fn update_to_empty_stops_rotation() {
        let rotator = AddressRotator::new(vec![tcp("a")]);
        rotator.update(vec![]);
        assert_eq!(rotator.next_target(), None);
    }
}
