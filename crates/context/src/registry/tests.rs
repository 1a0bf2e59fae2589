use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cordon_worker::GroupTree;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::LifecycleChange;
use crate::testing::inline;

fn registry() -> Registry {
	let tree = GroupTree::with_root_name("main");
	Registry::new(tree.root().clone(), None, inline())
}

fn read_u32(registry: &Registry, key: &ContextKey) -> Option<u32> {
	registry.get(key).and_then(|v| v.downcast_ref::<u32>().copied())
}

#[test]
fn put_then_get_returns_value() {
	let r = registry();
	let key = ContextKey::new("k");
	assert!(r.put(&key, Arc::new(1u32)).is_none());
	assert_eq!(read_u32(&r, &key), Some(1));
	assert_eq!(r.len(), 1);
}

#[test]
fn put_returns_previous_value() {
	let r = registry();
	let key = ContextKey::new("k");
	r.put(&key, Arc::new(1u32));
	let previous = r.put(&key, Arc::new(2u32));
	assert_eq!(previous.and_then(|v| v.downcast_ref::<u32>().copied()), Some(1));
	assert_eq!(read_u32(&r, &key), Some(2));
}

#[test]
fn repeated_get_hits_cache_without_miss() {
	let r = registry();
	let key = ContextKey::new("k");
	r.put(&key, Arc::new(7u32));

	r.get(&key);
	r.get(&key);
	r.get(&key);

	let stats = r.stats();
	assert_eq!(stats.misses, 1);
	assert_eq!(stats.hits, 2);
}

#[test]
fn cache_tracks_writes_to_recent_key() {
	let r = registry();
	let key = ContextKey::new("k");
	assert_eq!(read_u32(&r, &key), None, "absence is cached");
	r.put(&key, Arc::new(3u32));
	assert_eq!(read_u32(&r, &key), Some(3));
	r.remove(&key);
	assert_eq!(read_u32(&r, &key), None);
	assert_eq!(r.stats().misses, 1);
}

#[test]
fn alternating_keys_each_miss() {
	let r = registry();
	let a = ContextKey::new("a");
	let b = ContextKey::new("b");
	r.put(&a, Arc::new(1u32));
	r.put(&b, Arc::new(2u32));

	for _ in 0..3 {
		assert_eq!(read_u32(&r, &a), Some(1));
		assert_eq!(read_u32(&r, &b), Some(2));
	}
	assert_eq!(r.stats().misses, 6);
}

#[test]
fn keys_with_same_name_are_distinct() {
	let r = registry();
	let a = ContextKey::new("svc");
	let b = ContextKey::new("svc");
	r.put(&a, Arc::new(1u32));
	assert_eq!(read_u32(&r, &b), None);
}

#[test]
fn try_put_rejects_absent_arguments() {
	let r = registry();
	let key = ContextKey::new("k");
	assert!(matches!(r.try_put(None, Some(Arc::new(1u32))), Err(ContextError::InvalidArgument("key is absent"))));
	assert!(matches!(r.try_put(Some(&key), None), Err(ContextError::InvalidArgument("value is absent"))));
	assert!(r.is_empty());
	assert!(matches!(r.try_put(Some(&key), Some(Arc::new(1u32))), Ok(None)));
}

#[test]
fn disposed_registry_ignores_writes_and_reads() {
	let r = registry();
	let key = ContextKey::new("k");
	r.put(&key, Arc::new(1u32));

	assert!(r.advance(RegistryState::Valid, RegistryState::Disposing));
	assert!(r.advance(RegistryState::Disposing, RegistryState::Disposed));
	r.clear();

	assert!(r.put(&key, Arc::new(2u32)).is_none());
	assert!(r.get(&key).is_none());
	assert!(r.is_empty());
}

#[test]
fn state_transitions_are_one_way() {
	let r = registry();
	assert_eq!(r.state(), RegistryState::Valid);
	assert!(!r.advance(RegistryState::Disposing, RegistryState::Disposed));
	assert!(r.advance(RegistryState::Valid, RegistryState::Disposing));
	assert!(!r.advance(RegistryState::Valid, RegistryState::Disposing));
	assert!(r.advance(RegistryState::Disposing, RegistryState::Disposed));
	assert!(r.is_disposed());
}

#[test]
fn typed_access_downcasts() {
	let r = registry();
	let key = TypedKey::<String>::new("name");
	assert!(r.put_typed(&key, "alpha".to_string()).is_none());
	assert_eq!(r.get_typed(&key).as_deref().map(String::as_str), Some("alpha"));

	let wrong = TypedKey::<u32>::new("n");
	r.put(wrong.raw(), Arc::new("not a number"));
	assert!(r.get_typed(&wrong).is_none());
}

#[test]
fn get_or_init_runs_initializer_once() {
	let r = registry();
	let key = TypedKey::<u32>::new("lazy");
	let calls = AtomicUsize::new(0);

	let first = r.get_or_init(&key, || {
		calls.fetch_add(1, Ordering::Relaxed);
		41
	});
	let second = r.get_or_init(&key, || {
		calls.fetch_add(1, Ordering::Relaxed);
		99
	});

	assert_eq!((*first, *second), (41, 41));
	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn get_or_init_initializer_may_use_registry() {
	let r = registry();
	let base = TypedKey::<u32>::new("base");
	let derived = TypedKey::<u32>::new("derived");
	r.put_typed(&base, 10);

	let value = r.get_or_init(&derived, || r.get_typed(&base).map_or(0, |b| *b + 1));
	assert_eq!(*value, 11);
}

#[test]
fn listeners_deduplicate_and_filter() {
	let r = registry();
	let seen = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&seen);
	let listener: Arc<dyn LifecycleListener> = Arc::new(move |_: &LifecycleChange| {
		counter.fetch_add(1, Ordering::Relaxed);
	});

	assert!(r.add_listener(Some(LifecycleEvent::Disposing), Arc::clone(&listener)));
	assert!(!r.add_listener(Some(LifecycleEvent::Disposing), Arc::clone(&listener)));
	assert!(r.add_listener(None, Arc::clone(&listener)));

	assert_eq!(r.listeners().len(), 2);
	assert_eq!(r.listeners_for(LifecycleEvent::Disposing).len(), 1);
	assert_eq!(r.listeners_for(LifecycleEvent::ResourcesReleased).len(), 0);

	assert_eq!(r.fire(LifecycleEvent::Disposing), 2);
	assert_eq!(r.fire(LifecycleEvent::ResourcesReleased), 1);
	assert_eq!(seen.load(Ordering::Relaxed), 3);

	assert!(r.remove_listener(None, &listener));
	assert!(!r.remove_listener(None, &listener));
	assert_eq!(r.listeners().len(), 1);
}

fn loud_listener(_: &LifecycleChange) {
	panic!("listener failure");
}

#[test]
fn panicking_listener_does_not_stop_delivery() {
	let r = registry();
	let seen = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&seen);
	r.add_listener(None, Arc::new(loud_listener));
	r.add_listener(
		None,
		Arc::new(move |change: &LifecycleChange| {
			assert!(!change.old_value && change.new_value);
			counter.fetch_add(1, Ordering::Relaxed);
		}),
	);

	assert_eq!(r.fire(LifecycleEvent::Disposing), 1);
	assert_eq!(seen.load(Ordering::Relaxed), 1);
}

#[test]
fn concurrent_access_stays_coherent() {
	const THREADS: u32 = 8;
	const ROUNDS: u32 = 500;
	let r = registry();
	let shared = ContextKey::new("shared");
	let owned: Vec<ContextKey> = (0..THREADS).map(|t| ContextKey::new(format!("owned-{t}"))).collect();

	std::thread::scope(|scope| {
		for (t, key) in owned.iter().enumerate() {
			let r = &r;
			let shared = &shared;
			let t = t as u32;
			scope.spawn(move || {
				for i in 0..ROUNDS {
					r.put(key, Arc::new(i));
					assert_eq!(read_u32(r, key), Some(i), "thread {t} lost its own write");
					if i % 7 == 0 {
						assert!(r.remove(key).is_some());
						assert_eq!(read_u32(r, key), None, "thread {t} read a removed key");
						r.put(key, Arc::new(i));
					}
					r.put(shared, Arc::new(t * 10_000 + i));
					let seen = read_u32(r, shared).expect("shared key is never removed");
					assert!(seen % 10_000 < ROUNDS && seen / 10_000 < THREADS);
				}
			});
		}
	});

	for key in &owned {
		assert_eq!(read_u32(&r, key), Some(ROUNDS - 1));
	}
	let last = read_u32(&r, &shared).unwrap();
	assert_eq!(last % 10_000, ROUNDS - 1, "final shared value is some thread's last write");
	assert_eq!(r.len(), owned.len() + 1);
}

#[test]
fn display_names_group() {
	assert_eq!(registry().to_string(), "Registry[group=main]");
}

#[derive(Debug, Clone)]
enum Op {
	Put(usize, u32),
	Remove(usize),
	Get(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0..3usize, any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
		(0..3usize).prop_map(Op::Remove),
		(0..3usize).prop_map(Op::Get),
	]
}

proptest! {
	/// Every read agrees with a plain map under any interleaving of writes and reads.
	#[test]
	fn prop_cache_is_coherent_with_table(ops in prop::collection::vec(arb_op(), 1..64)) {
		let r = registry();
		let keys: Vec<_> = (0..3).map(|i| ContextKey::new(format!("k{i}"))).collect();
		let mut model: HashMap<usize, u32> = HashMap::new();

		for op in ops {
			match op {
				Op::Put(k, v) => {
					let previous = r.put(&keys[k], Arc::new(v)).and_then(|p| p.downcast_ref::<u32>().copied());
					prop_assert_eq!(previous, model.insert(k, v));
				}
				Op::Remove(k) => {
					let previous = r.remove(&keys[k]).and_then(|p| p.downcast_ref::<u32>().copied());
					prop_assert_eq!(previous, model.remove(&k));
				}
				Op::Get(k) => {
					prop_assert_eq!(read_u32(&r, &keys[k]), model.get(&k).copied());
				}
			}
		}
		prop_assert_eq!(r.len(), model.len());
	}
}
