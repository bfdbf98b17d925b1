//! Process-wide library initialisation.
//!
//! [`initialize()`] must be called before creating a [`Session`](crate::Session),
//! and may be called more than once. Each call should be paired with a
//! [`shutdown()`]. Sessions that already exist are unaffected by the final
//! shutdown, new sessions are refused.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Mutex;

use crate::random;

static STATE: Mutex<InitState> = Mutex::new(InitState { refs: 0 });

struct InitState {
    refs: usize,
}

fn lock() -> std::sync::MutexGuard<'static, InitState> {
    // The state is a plain counter, a poisoned lock is still usable
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Initialises the library. Idempotent and reference counted.
///
/// The first call checks the system RNG.
pub fn initialize() -> Result<()> {
    let mut st = lock();
    if st.refs == 0 {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random::fill_random(&mut a)?;
        random::fill_random(&mut b)?;
        if a == b {
            error!("RNG self-test failed");
            return Err(Error::msg("RNG self-test failed"));
        }
        debug!("sunset-libssh initialised");
    }
    st.refs += 1;
    Ok(())
}

/// Releases one [`initialize()`] reference.
///
/// Extra calls are ignored.
pub fn shutdown() {
    let mut st = lock();
    match st.refs {
        0 => debug!("shutdown() without initialize()"),
        1 => {
            st.refs = 0;
            debug!("sunset-libssh shut down");
        }
        _ => st.refs -= 1,
    }
}

pub fn is_initialized() -> bool {
    lock().refs > 0
}

/// Fails with [`Error::NotInitialized`] unless initialised
pub(crate) fn check() -> Result<()> {
    if is_initialized() {
        Ok(())
    } else {
        Err(Error::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use crate::init::*;
    use crate::sshlog::init_test_log;

    #[test]
    fn refcounted() {
        init_test_log();
        // other tests hold references concurrently, only relative behaviour is checked
        initialize().unwrap();
        initialize().unwrap();
        assert!(is_initialized());
        shutdown();
        assert!(is_initialized());
        check().unwrap();
        shutdown();
    }
}
