use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;

use crate::UnitKind;

/// Returns the ambient runtime handle, falling back to a shared worker runtime.
pub(crate) fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("cordon-worker-global")
			.build()
			.expect("failed to build cordon-worker global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns an async unit body on the ambient runtime.
pub(crate) fn spawn_task<F>(kind: UnitKind, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(unit_kind = kind.as_str(), "worker.spawn");
	runtime_handle().spawn(fut)
}

/// Spawns a dedicated named OS thread for a unit body.
pub(crate) fn spawn_named_thread<F, R>(kind: UnitKind, name: String, f: F) -> std::io::Result<std::thread::JoinHandle<R>>
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	tracing::trace!(unit_kind = kind.as_str(), thread = %name, "worker.spawn_named_thread");
	std::thread::Builder::new().name(name).spawn(f)
}
