use std::sync::atomic::{AtomicU64, Ordering};

/// Connection role, fixed at construction. Determines stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that opened the connection. Uses odd stream ids (1, 3, 5, …).
    Initiator,
    /// The side that accepted it. Uses even stream ids (0, 2, 4, …).
    Acceptor,
}

impl Role {
    /// Whether this side is the initiator.
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Allocates locally-originated stream ids with role parity.
///
/// Ids advance by two, so the two sides can never collide and an id is never
/// reused for the lifetime of the multiplexer.
pub struct StreamIdAllocator {
    next: AtomicU64,
}

impl StreamIdAllocator {
    /// Create an allocator for the given role.
    pub fn new(role: Role) -> Self {
        let start = match role {
            Role::Initiator => 1,
            Role::Acceptor => 0,
        };
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Allocate the next stream id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}
