use cloudbench_core::prelude::{AbortHandle, AbortLevel};
use tokio::signal;

/// Translate Ctrl-C into aborts. The first signal stops scheduling new iterations, the second one
/// also interrupts iterations that are waiting on the cloud.
pub(crate) fn start_signal_listener(runtime: &tokio::runtime::Runtime) -> AbortHandle {
    let handle = AbortHandle::default();

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        loop {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C, aborting is only possible via SLA: {e}");
                return;
            }

            match listener_handle.level() {
                None => {
                    println!("Received abort signal, waiting for running iterations. Press Ctrl-C again to interrupt them.");
                    listener_handle.soft_abort();
                }
                Some(AbortLevel::Soft) => {
                    println!("Received second abort signal, interrupting running iterations...");
                    listener_handle.hard_abort();
                }
                Some(AbortLevel::Hard) => return,
            }
        }
    });

    handle
}
