use inferno::{ComponentType, InfernoError, Repository, RepositoryConfig};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
struct Name(&'static str);
#[derive(Debug, Clone, PartialEq)]
struct Mass(f32);
#[derive(Debug, Clone, PartialEq)]
struct Charge(i8);
#[derive(Debug, Clone, PartialEq)]
struct Spin(u8);

fn repository() -> Repository {
    Repository::new(RepositoryConfig::new("mutation")).unwrap()
}

#[test]
fn test_resolve_is_order_independent() {
    let repo = repository();
    let forward = repo
        .resolve(&[ComponentType::of::<Name>(), ComponentType::of::<Mass>()])
        .unwrap();
    let backward = repo
        .resolve(&[ComponentType::of::<Mass>(), ComponentType::of::<Name>()])
        .unwrap();
    assert!(Arc::ptr_eq(&forward, &backward));

    let entity = repo.create((Mass(1.0), Name("proton"))).unwrap();
    assert!(Arc::ptr_eq(&entity.composition(), &forward));
}

#[test]
fn test_resolve_rejects_duplicates() {
    let repo = repository();
    let err = repo
        .resolve(&[ComponentType::of::<Mass>(), ComponentType::of::<Mass>()])
        .unwrap_err();
    assert!(matches!(err, InfernoError::DuplicateComponent(_)));
}

#[test]
fn test_empty_bundle_lands_in_root() {
    let repo = repository();
    let entity = repo.create(()).unwrap();
    assert!(Arc::ptr_eq(&entity.composition(), repo.root()));
    assert!(entity.component_types().is_empty());

    assert!(entity.add(Spin(1)).unwrap());
    assert!(entity.has::<Spin>());
    assert!(entity.remove::<(Spin,)>().unwrap());
    assert!(Arc::ptr_eq(&entity.composition(), repo.root()));
}

#[test]
fn test_add_existing_type_replaces_value_in_place() {
    let repo = repository();
    let entity = repo.create((Name("electron"), Mass(0.5))).unwrap();
    let id = entity.id();
    let before = entity.composition();

    assert!(entity.add(Mass(0.511)).unwrap());
    assert!(Arc::ptr_eq(&before, &entity.composition()));
    assert_eq!(entity.id(), id);
    assert!(entity.contains(&Mass(0.511)));
    assert!(entity.contains(&Name("electron")));
}

#[test]
fn test_remove_absent_type_is_noop() {
    let repo = repository();
    let entity = repo.create((Name("neutron"),)).unwrap();
    let id = entity.id();
    assert!(!entity.remove::<(Charge,)>().unwrap());
    assert_eq!(entity.id(), id);
}

#[test]
fn test_transmute_adds_and_removes_at_once() {
    let repo = repository();
    let entity = repo.create((Name("muon"), Charge(-1))).unwrap();
    assert!(repo
        .transmute::<(Mass, Spin), (Charge,)>(&entity, (Mass(105.7), Spin(1)))
        .unwrap());

    assert!(!entity.has::<Charge>());
    assert!(entity.contains(&Mass(105.7)));
    assert!(entity.contains(&Spin(1)));
    assert!(entity.contains(&Name("muon")));
    assert_eq!(entity.component_types().len(), 3);
}

#[test]
fn test_transmute_bundle_order_does_not_matter() {
    let repo = repository();
    let first = repo.create((Name("first"),)).unwrap();
    let second = repo.create((Name("second"),)).unwrap();

    assert!(repo
        .transmute::<(Mass, Spin), ()>(&first, (Mass(1.0), Spin(2)))
        .unwrap());
    // Same added set written the other way round reuses the cached transition
    assert!(repo
        .transmute::<(Spin, Mass), ()>(&second, (Spin(20), Mass(10.0)))
        .unwrap());

    assert!(Arc::ptr_eq(&first.composition(), &second.composition()));
    assert_eq!(second.get::<Mass>().map(|m| m.get()), Some(Mass(10.0)));
    assert_eq!(second.get::<Spin>().map(|s| s.get()), Some(Spin(20)));
    assert_eq!(first.get::<Mass>().map(|m| m.get()), Some(Mass(1.0)));
    assert_eq!(first.get::<Spin>().map(|s| s.get()), Some(Spin(2)));
    assert_eq!(repo.view::<(Mass, Spin)>().count(), 2);

    // In-place replacement goes through the same ordering
    assert!(repo
        .transmute::<(Spin, Mass), ()>(&first, (Spin(3), Mass(4.0)))
        .unwrap());
    assert!(first.contains(&Mass(4.0)));
    assert!(first.contains(&Spin(3)));
}

#[test]
fn test_transition_is_memoized_per_source() {
    let repo = repository();
    let first = repo.create((Name("a"),)).unwrap();
    let second = repo.create((Name("b"),)).unwrap();
    first.add(Mass(1.0)).unwrap();
    second.add(Mass(2.0)).unwrap();
    assert!(Arc::ptr_eq(&first.composition(), &second.composition()));
    // root, {Name}, {Name, Mass}
    assert_eq!(repo.composition_count(), 3);
}

#[test]
fn test_component_refs_survive_moves() {
    let repo = repository();
    let entity = repo.create((Mass(1.0),)).unwrap();
    let mass = entity.get::<Mass>().unwrap();
    entity.add(Name("heavy")).unwrap();
    mass.set(Mass(9.0));
    assert!(entity.contains(&Mass(9.0)));
    assert!(mass.ptr_eq(&entity.get::<Mass>().unwrap()));
}

#[test]
fn test_prepare_and_emplace() {
    let repo = repository();
    let prepared = repo.prepare::<(Charge, Name)>().unwrap();
    let a = repo
        .emplace_prepared(&prepared, (Charge(1), Name("positron")))
        .unwrap();
    let b = repo.emplace((Name("antiproton"), Charge(-1))).unwrap();

    assert!(Arc::ptr_eq(prepared.composition(), &a.composition()));
    assert!(Arc::ptr_eq(&a.composition(), &b.composition()));
    assert!(a.id().is_external_array());
    assert!(a.contains(&Charge(1)));
    assert!(b.contains(&Name("antiproton")));
    assert_eq!(repo.view::<(Name, Charge)>().count(), 2);

    // Structural changes hand the entity a pooled array
    a.add(Mass(0.5)).unwrap();
    assert!(!a.id().is_external_array());

    assert!(matches!(
        repo.prepare::<()>(),
        Err(InfernoError::EmptyComponents)
    ));
}

#[test]
fn test_emulate_shares_prefab_cells() {
    let repo = repository();
    let prefab = repo.create((Name("template"), Mass(3.0))).unwrap();
    let copy = repo.emulate(&prefab, (Spin(2),)).unwrap();

    assert!(copy.contains(&Name("template")));
    assert!(copy.contains(&Spin(2)));
    assert!(!prefab.has::<Spin>());

    prefab.get::<Mass>().unwrap().set(Mass(4.0));
    assert!(copy.contains(&Mass(4.0)));

    let bare = repo.create(()).unwrap();
    let from_bare = repo.emulate(&bare, (Spin(0),)).unwrap();
    assert_eq!(from_bare.component_types(), vec![ComponentType::of::<Spin>()]);
}

#[test]
fn test_size_tracks_live_entities() {
    let repo = repository();
    let entities: Vec<_> = (0..10).map(|i| repo.create((Charge(i),)).unwrap()).collect();
    assert_eq!(repo.size(), 10);
    for entity in entities.iter().step_by(2) {
        entity.delete();
    }
    assert_eq!(repo.size(), 5);
    entities[1].set_enabled(false).unwrap();
    assert_eq!(repo.size(), 4);
    entities[1].add(Mass(1.0)).unwrap();
    assert_eq!(repo.size(), 4);
}
