mod error;
mod pool;

pub use error::Error;
pub use pool::*;

/// What a storage backend can do for the queue core. Drivers advertise this
/// once at startup; the claim and wakeup strategies key off it instead of
/// probing at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The engine supports `FOR UPDATE SKIP LOCKED`, so a single UPDATE can
    /// claim under contention.
    pub skip_locked: bool,
    /// The engine has a lightweight notification primitive (LISTEN/NOTIFY)
    /// that can wake waiters across processes.
    pub listen_notify: bool,
    /// The engine has a native JSON column type. Engines without one store
    /// JSON as text.
    pub json_column: bool,
    /// The backend exposes a blocking claim (HTTP long-poll). Workers route
    /// their idle strategy through it instead of the in-process waitlist.
    pub long_poll: bool,
}

impl Capabilities {
    pub const POSTGRES: Capabilities = Capabilities {
        skip_locked: true,
        listen_notify: true,
        json_column: true,
        long_poll: false,
    };

    pub const SQLITE: Capabilities = Capabilities {
        skip_locked: false,
        listen_notify: false,
        json_column: false,
        long_poll: false,
    };

    pub const REDIS: Capabilities = Capabilities {
        skip_locked: false,
        listen_notify: false,
        json_column: false,
        long_poll: false,
    };

    pub const HTTP: Capabilities = Capabilities {
        skip_locked: false,
        listen_notify: false,
        json_column: false,
        long_poll: true,
    };
}

#[cfg(test)]
mod tests {
    use super::Capabilities;

    #[test]
    fn capability_presets() {
        assert!(Capabilities::POSTGRES.skip_locked);
        assert!(Capabilities::POSTGRES.listen_notify);
        assert!(!Capabilities::SQLITE.skip_locked);
        assert!(!Capabilities::REDIS.listen_notify);
        assert!(Capabilities::HTTP.long_poll);
    }
}
