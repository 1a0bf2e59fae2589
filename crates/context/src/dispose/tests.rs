use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cordon_worker::GroupTree;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::testing::{ClosedSink, StalledSink, init_tracing, inline};
use crate::{ContextConfig, ContextKey, LifecycleChange, TopLevelResource};

type Log = Arc<Mutex<Vec<String>>>;

struct Recorded {
	name: &'static str,
	log: Log,
	fail: bool,
}

impl TopLevelResource for Recorded {
	fn name(&self) -> &str {
		self.name
	}

	fn release(&self) -> Result<(), String> {
		self.log.lock().push(format!("release:{}", self.name));
		if self.fail { Err("refused".to_string()) } else { Ok(()) }
	}
}

struct Exploding;

impl TopLevelResource for Exploding {
	fn name(&self) -> &str {
		"exploding"
	}

	fn release(&self) -> Result<(), String> {
		panic!("resource exploded");
	}
}

struct Counting(Arc<AtomicUsize>);

impl TopLevelResource for Counting {
	fn name(&self) -> &str {
		"counting"
	}

	fn release(&self) -> Result<(), String> {
		self.0.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}
}

fn record_events(registry: &Registry, log: &Log) {
	let log = Arc::clone(log);
	registry.add_listener(
		None,
		Arc::new(move |change: &LifecycleChange| {
			log.lock().push(change.event.to_string());
		}),
	);
}

fn disposed(outcome: DisposeOutcome) -> DisposalReport {
	match outcome {
		DisposeOutcome::Disposed(report) => report,
		DisposeOutcome::AlreadyDisposed => panic!("expected a fresh disposal"),
	}
}

fn fast_config() -> ContextConfig {
	ContextConfig::default()
		.with_disposal_timeout(Duration::from_millis(200))
		.with_interrupt_timeout(Duration::from_millis(200))
		.with_interrupt_poll(Duration::from_millis(5))
}

#[tokio::test]
async fn phases_run_in_order_on_the_group_queue() {
	init_tracing();
	let tree = GroupTree::new();
	let index = ContextIndex::new(tree.clone());
	let app = tree.root().new_child("app");
	let registry = index.materialize(&app, None).unwrap();
	let log: Log = Arc::default();
	record_events(&registry, &log);
	registry.attach_resource(Arc::new(Recorded {
		name: "window",
		log: Arc::clone(&log),
		fail: false,
	}));
	let key = ContextKey::new("svc");
	registry.put(&key, Arc::new(1u32));

	let admin = tree.root().attach("admin");
	let report = disposed(index.dispose(&registry, &admin).await.unwrap());

	assert_eq!(*log.lock(), vec!["disposing".to_string(), "release:window".to_string(), "resources_released".to_string()]);
	assert_eq!(report.resources, Some(ReleaseSummary { released: 1, failed: 0 }));
	assert!(report.queue_drained);
	assert_eq!(report.units_remaining, 0);
	assert_eq!(registry.state(), RegistryState::Disposed);
	assert!(registry.is_empty());
	assert!(registry.get(&key).is_none());
	assert!(index.lookup(&app).is_none());
	assert_eq!(index.live_count(), 0);
}

#[tokio::test]
async fn second_disposal_is_a_no_op() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let registry = index.materialize_with(&app, None, inline()).unwrap();
	let releases = Arc::new(AtomicUsize::new(0));
	registry.attach_resource(Arc::new(Counting(Arc::clone(&releases))));
	let fired = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&fired);
	registry.add_listener(
		Some(LifecycleEvent::Disposing),
		Arc::new(move |_: &LifecycleChange| {
			counter.fetch_add(1, Ordering::Relaxed);
		}),
	);

	let admin = tree.root().attach("admin");
	disposed(index.dispose(&registry, &admin).await.unwrap());
	assert_eq!(index.dispose(&registry, &admin).await.unwrap(), DisposeOutcome::AlreadyDisposed);
	assert_eq!(index.dispose_detached(&registry).await, DisposeOutcome::AlreadyDisposed);

	assert_eq!(releases.load(Ordering::Relaxed), 1);
	assert_eq!(fired.load(Ordering::Relaxed), 1);
	assert_eq!(index.live_count(), 0);
}

#[tokio::test]
async fn disposal_from_inside_the_group_is_rejected() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let inner = app.new_child("inner");
	let registry = index.materialize_with(&app, None, inline()).unwrap();

	for caller in [app.attach("self"), inner.attach("nested")] {
		let err = index.dispose(&registry, &caller).await.unwrap_err();
		assert!(matches!(err, ContextError::IllegalState(_)), "got {err:?}");
	}
	assert_eq!(registry.state(), RegistryState::Valid);
	assert!(index.lookup(&app).is_some());
	assert_eq!(index.live_count(), 1);
}

#[tokio::test]
async fn failing_resources_do_not_stop_the_release_pass() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let registry = index.materialize(&app, None).unwrap();
	let log: Log = Arc::default();
	registry.attach_resource(Arc::new(Recorded {
		name: "tray",
		log: Arc::clone(&log),
		fail: true,
	}));
	registry.attach_resource(Arc::new(Exploding));
	registry.attach_resource(Arc::new(Recorded {
		name: "window",
		log: Arc::clone(&log),
		fail: false,
	}));

	let report = disposed(index.dispose_detached(&registry).await);

	assert_eq!(report.resources, Some(ReleaseSummary { released: 1, failed: 2 }));
	assert_eq!(*log.lock(), vec!["release:tray".to_string(), "release:window".to_string()]);
	assert_eq!(registry.resource_count(), 0);
}

#[tokio::test]
async fn refused_teardown_runs_on_the_caller() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let sink = Arc::new(ClosedSink::default());
	let registry = index.materialize_with(&app, None, sink.clone()).unwrap();
	let releases = Arc::new(AtomicUsize::new(0));
	registry.attach_resource(Arc::new(Counting(Arc::clone(&releases))));

	let report = disposed(index.dispose_detached(&registry).await);

	assert_eq!(report.resources, Some(ReleaseSummary { released: 1, failed: 0 }));
	assert!(!report.queue_drained);
	assert_eq!(releases.load(Ordering::Relaxed), 1);
	assert_eq!(sink.attempts.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn stalled_sink_times_out_and_disposal_completes() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let sink = Arc::new(StalledSink::default());
	let registry = index.materialize_with(&app, None, sink.clone()).unwrap();

	let report = disposed(index.dispose_detached(&registry).await);

	assert_eq!(report.resources, None);
	assert!(!report.queue_drained);
	assert_eq!(sink.held.lock().len(), 2);
	assert!(sink.closed.load(Ordering::Acquire));
	assert!(registry.is_disposed());
	assert_eq!(index.live_count(), 0);
}

#[tokio::test]
async fn live_units_are_interrupted() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let worker_group = app.new_child("workers");
	let registry = index.materialize_with(&app, None, inline()).unwrap();
	let task = app.spawn_task("listener", |ctx| async move { ctx.interrupted().await });
	let nested = worker_group.spawn_task("poller", |ctx| async move { ctx.interrupted().await });
	assert_eq!(app.live_unit_count(), 2);

	let report = disposed(index.dispose_detached(&registry).await);

	assert_eq!(report.units_remaining, 0);
	assert_eq!(app.live_unit_count(), 0);
	assert!(task.unit().is_interrupted());
	assert!(nested.unit().is_interrupted());
}

#[tokio::test]
async fn stubborn_units_are_reported_not_awaited() {
	let tree = GroupTree::new();
	let config = fast_config().with_interrupt_timeout(Duration::from_millis(30));
	let index = ContextIndex::with_config(tree.clone(), config);
	let app = tree.root().new_child("app");
	let registry = index.materialize_with(&app, None, inline()).unwrap();
	let stubborn = app.spawn_thread("stubborn", |_ctx| std::thread::sleep(Duration::from_millis(400))).unwrap();

	let report = disposed(index.dispose_detached(&registry).await);

	assert_eq!(report.units_remaining, 1);
	assert!(registry.is_disposed());
	assert!(stubborn.unit().is_interrupted());
	stubborn.join().unwrap();
}

#[tokio::test]
async fn nested_registries_are_retired_with_their_ancestor() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let plugin = app.new_child("plugin");
	let leaf = plugin.new_child("leaf");
	let outer = index.materialize_with(&app, None, inline()).unwrap();
	let nested_sink = inline();
	let nested = index.materialize_with(&plugin, None, nested_sink.clone()).unwrap();
	let releases = Arc::new(AtomicUsize::new(0));
	nested.attach_resource(Arc::new(Counting(Arc::clone(&releases))));
	nested.put(&ContextKey::new("k"), Arc::new(1u32));
	let fired = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&fired);
	nested.add_listener(
		None,
		Arc::new(move |_: &LifecycleChange| {
			counter.fetch_add(1, Ordering::Relaxed);
		}),
	);
	assert!(Arc::ptr_eq(&index.resolve_group(&leaf).unwrap(), &nested));
	assert_eq!(index.live_count(), 2);

	let report = disposed(index.dispose_detached(&outer).await);

	assert_eq!(report.retired, 1);
	assert_eq!(report.groups_removed, 3, "app, plugin and the memoized leaf");
	assert_eq!(nested.state(), RegistryState::Disposed);
	assert!(nested.is_empty());
	assert_eq!(releases.load(Ordering::Relaxed), 1);
	assert_eq!(fired.load(Ordering::Relaxed), 0);
	assert!(nested_sink.closed.load(Ordering::Acquire));
	for group in [&app, &plugin, &leaf] {
		assert!(index.lookup(group).is_none(), "{group} still mapped");
	}
	assert_eq!(index.live_count(), 0);
}

#[tokio::test]
async fn disposing_the_main_registry_allows_a_fresh_bootstrap() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let unit = app.attach("caller");
	let first = index.try_resolve(&unit).unwrap();
	assert!(index.is_main(&first));

	disposed(index.dispose_detached(&first).await);
	assert!(index.main().is_none());
	assert_eq!(index.live_count(), 0);

	let second = index.try_resolve(&unit).unwrap();
	assert!(!Arc::ptr_eq(&first, &second));
	assert!(index.is_main(&second));
	assert!(!second.is_disposed());
}

#[tokio::test]
async fn writes_after_disposal_are_ignored() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let registry = index.materialize_with(&app, None, inline()).unwrap();
	disposed(index.dispose_detached(&registry).await);

	let key = ContextKey::new("late");
	assert!(registry.put(&key, Arc::new(1u32)).is_none());
	assert!(registry.get(&key).is_none());
	assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn resources_attached_after_the_release_pass_are_released_at_once() {
	let tree = GroupTree::new();
	let index = ContextIndex::with_config(tree.clone(), fast_config());
	let app = tree.root().new_child("app");
	let registry = index.materialize_with(&app, None, inline()).unwrap();
	let releases = Arc::new(AtomicUsize::new(0));

	let weak = Arc::downgrade(&registry);
	let counter = Arc::clone(&releases);
	let attached_late = Arc::new(AtomicUsize::new(0));
	let late = Arc::clone(&attached_late);
	registry.add_listener(
		Some(LifecycleEvent::ResourcesReleased),
		Arc::new(move |_: &LifecycleChange| {
			if let Some(registry) = weak.upgrade()
				&& !registry.attach_resource(Arc::new(Counting(Arc::clone(&counter))))
			{
				late.fetch_add(1, Ordering::Relaxed);
			}
		}),
	);

	disposed(index.dispose_detached(&registry).await);
	assert_eq!(attached_late.load(Ordering::Relaxed), 1);
	assert_eq!(releases.load(Ordering::Relaxed), 1);

	assert!(!registry.attach_resource(Arc::new(Counting(Arc::clone(&releases)))));
	assert_eq!(releases.load(Ordering::Relaxed), 2);
	assert_eq!(registry.resource_count(), 0);
}
