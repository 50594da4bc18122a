use inferno::{ComponentType, Entity, Repository, RepositoryConfig, StateTag};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
struct Pos(f32, f32);
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
struct Vel(f32, f32);
#[derive(Debug, Clone, PartialEq)]
struct Counter(u64);
#[derive(Debug, Clone, PartialEq)]
struct Marker;

#[derive(Debug, Clone, Copy)]
struct Hot;

impl StateTag for Hot {
    fn ordinal(&self) -> u32 {
        0
    }
}

fn repository() -> Repository {
    Repository::new(RepositoryConfig::new("stress")).unwrap()
}

#[test]
fn test_concurrent_resolve_yields_one_composition() {
    let repo = repository();
    let barrier = Arc::new(Barrier::new(8));
    let resolved: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    barrier.wait();
                    let types = if i % 2 == 0 {
                        [ComponentType::of::<Pos>(), ComponentType::of::<Vel>()]
                    } else {
                        [ComponentType::of::<Vel>(), ComponentType::of::<Pos>()]
                    };
                    repo.resolve(&types).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for composition in &resolved[1..] {
        assert!(Arc::ptr_eq(&resolved[0], composition));
    }
}

#[test]
fn test_concurrent_create_keeps_ids_unique() {
    let repo = repository();
    let created: Vec<Entity> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let repo = repo.clone();
                s.spawn(move || {
                    (0..2_500)
                        .map(|i| repo.create((Counter(i),)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });
    let mut ids: Vec<u32> = created.iter().map(|e| e.id().raw()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10_000);
    assert_eq!(repo.view::<(Counter,)>().count(), 10_000);
}

#[test]
fn test_racing_mutations_on_one_entity() {
    let repo = repository();
    let entity = repo.create((Counter(0),)).unwrap();
    thread::scope(|s| {
        for _ in 0..4 {
            let entity = entity.clone();
            s.spawn(move || {
                for _ in 0..200 {
                    entity.add(Marker).unwrap();
                    entity.remove::<(Marker,)>().unwrap();
                    entity.set_state(&Hot);
                }
            });
        }
    });
    assert!(entity.has::<Counter>());
    assert!(!entity.has::<Marker>());
    assert_eq!(entity.composition().state_count(&Hot), 1);
    assert_eq!(repo.view::<(Counter,)>().count(), 1);
}

#[test]
fn test_views_stay_consistent_under_churn() {
    let repo = repository();
    for i in 0..1_000 {
        repo.create((Counter(i), Pos(0.0, 0.0))).unwrap();
    }
    let stop = AtomicBool::new(false);
    let iterations = AtomicUsize::new(0);

    thread::scope(|s| {
        // Readers: every yielded entity must hold what the view asked for
        for _ in 0..3 {
            s.spawn(|| {
                loop {
                    for (counter, pos, entity) in repo.view::<(Counter, Pos)>().iter() {
                        let _ = counter.read().0;
                        let _ = pos.read().0;
                        assert!(!entity.is_deleted() || !entity.has::<Counter>());
                    }
                    iterations.fetch_add(1, Ordering::Relaxed);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                }
            });
        }
        // Writers: create, mutate, delete
        let writers: Vec<_> = (0..2)
            .map(|w| {
                let repo = repo.clone();
                s.spawn(move || {
                    for i in 0..500u64 {
                        let entity = repo.create((Counter(i), Pos(w as f32, 0.0))).unwrap();
                        entity.add(Vel(1.0, 1.0)).unwrap();
                        if i % 3 == 0 {
                            entity.remove::<(Pos,)>().unwrap();
                        }
                        if i % 2 == 0 {
                            entity.delete();
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Release);
    });

    assert!(iterations.load(Ordering::Relaxed) > 0);
    // Survivors: odd i not divisible by 3, per writer
    let survivors_with_pos = (0..500u64).filter(|i| i % 2 == 1 && i % 3 != 0).count();
    assert_eq!(
        repo.view::<(Counter, Pos)>().count(),
        1_000 + 2 * survivors_with_pos
    );
}
