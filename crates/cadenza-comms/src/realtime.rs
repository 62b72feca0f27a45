//! Real-time scheduling for audio threads.

use cadenza_core::{EngineError, Result};

/// Switch the calling thread to SCHED_FIFO at the maximum priority allowed
/// under `RLIMIT_RTPRIO`.
///
/// When the limit is zero (no realtime privileges) this logs a warning and
/// returns Ok - the engine keeps running at normal priority rather than
/// refusing to start.
#[allow(unsafe_code)]
pub fn promote_to_rt_priority() -> Result<()> {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut limits) } < 0 {
        return Err(EngineError::os("getrlimit(RLIMIT_RTPRIO)"));
    }

    let max_rt_prio = limits.rlim_max;
    tracing::info!("max realtime priority: {max_rt_prio}");
    if max_rt_prio == 0 {
        tracing::warn!(
            "realtime scheduling not available; see e.g. \
             http://jackaudio.org/faq/linux_rt_config.html to enable it"
        );
        return Ok(());
    }

    let params = libc::sched_param {
        sched_priority: max_rt_prio as libc::c_int,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &params) } < 0 {
        return Err(EngineError::os(format!(
            "sched_setscheduler(0, SCHED_FIFO, {{sched_priority={max_rt_prio}}})"
        )));
    }

    tracing::info!("using realtime priority {max_rt_prio} for audio thread");
    Ok(())
}
