//! Standalone plugin-host process.
//!
//! Runs one third-party plugin, driven by the engine over a named pipe and
//! the shared buffer arena. This isolates the plugin so that a crash takes
//! down this process, not the engine.
//!
//! Usage:
//!   cadenza-plugin-host ladspa <library.so> <label> <pipe-path> [sample-rate]
//!   cadenza-plugin-host lv2 <binary.so> <bundle-path> <uri> <pipe-path> [sample-rate]
//!
//! The host process will:
//! 1. Create the control fifo and wait for the engine to connect
//! 2. Load the plugin
//! 3. Service MEMORY_MAP / PROCESS_BLOCK commands until the pipe closes

use std::env;
use std::ffi::CString;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::process;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;

use cadenza_core::SampleRate;
use cadenza_sidecar::{HostLoop, HostSpec, create_host};

fn usage() -> ! {
    eprintln!(
        "usage: cadenza-plugin-host ladspa <library.so> <label> <pipe-path> [sample-rate]\n\
                cadenza-plugin-host lv2 <binary.so> <bundle-path> <uri> <pipe-path> [sample-rate]"
    );
    process::exit(1);
}

fn parse_args(args: &[String]) -> Option<(HostSpec, String, SampleRate)> {
    let parse_rate = |arg: Option<&String>| -> Option<SampleRate> {
        arg.map_or(Some(48_000), |s| s.parse().ok())
    };

    match args {
        [kind, library, label, pipe, rest @ ..] if kind == "ladspa" && rest.len() <= 1 => Some((
            HostSpec::Ladspa {
                library_path: library.clone(),
                label: label.clone(),
            },
            pipe.clone(),
            parse_rate(rest.first())?,
        )),
        [kind, binary, bundle, uri, pipe, rest @ ..] if kind == "lv2" && rest.len() <= 1 => Some((
            HostSpec::Lv2 {
                binary_path: binary.clone(),
                bundle_path: bundle.clone(),
                uri: uri.clone(),
            },
            pipe.clone(),
            parse_rate(rest.first())?,
        )),
        _ => None,
    }
}

#[allow(unsafe_code)]
fn open_control_pipe(path: &str) -> anyhow::Result<RawFd> {
    let c_path = CString::new(path).context("invalid pipe path")?;
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        bail!("failed to create fifo {path}: {}", std::io::Error::last_os_error());
    }

    // Blocks until the engine connects its write end
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {path}"))?;
    Ok(file.into_raw_fd())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some((spec, pipe_path, sample_rate)) = parse_args(&args) else {
        usage();
    };

    tracing::info!("hosting {spec:?} at {sample_rate} Hz, control pipe {pipe_path}");

    let pipe_fd = open_control_pipe(&pipe_path)?;
    let mut host = create_host(&spec, sample_rate)
        .map_err(|err| anyhow::anyhow!("failed to load plugin: {err}"))?;

    let mut host_loop = HostLoop::new();
    match host_loop.main_loop(pipe_fd, host.as_mut()) {
        Ok(()) => Ok(()),
        Err(cadenza_core::EngineError::ConnectionClosed) => {
            tracing::info!("engine closed the control pipe");
            Ok(())
        }
        Err(err) => Err(anyhow::anyhow!("plugin host failed: {err}")),
    }
}
