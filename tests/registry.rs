use rayon::prelude::*;
use tilestore::{
    config::Config,
    context::{Context, ContextError},
    fragment::{Cell, FragmentId},
    registry::{ArrayHandle, RegistryError},
    schema::ArraySchema,
    storage::StorageUri,
};

fn base_uri(path: &tempfile::TempDir) -> StorageUri {
    StorageUri::new(format!("file://{}", path.path().to_str().unwrap())).unwrap()
}

fn create_array(context: &Context, uri: &StorageUri, fragments: u64) -> Vec<FragmentId> {
    context
        .create_array(uri, &ArraySchema::new([0, 99], "a").unwrap())
        .unwrap();
    let array = context.open_array(uri).unwrap();
    (0..fragments)
        .map(|i| {
            let mut write = context.write_query(&array);
            write.submit(&[Cell::new(i, vec![1, 2, 3])]).unwrap();
            write.finalize().unwrap().unwrap()
        })
        .collect()
}

fn open_count(context: &Context, array: &StorageUri) -> usize {
    context.registry().open_count(array)
}

#[test]
#[cfg_attr(miri, ignore)]
fn registry_open_close() {
    let path = tempfile::TempDir::new().unwrap();
    let context = Context::new(Config::default()).unwrap();
    let uri = base_uri(&path).join("array").unwrap();
    create_array(&context, &uri, 0);
    assert!(context.registry().open_arrays().is_empty());

    let a = context.open_array(&uri).unwrap();
    let b = context.open_array(&uri).unwrap();
    assert_eq!(open_count(&context, &uri), 2);
    #[cfg(unix)]
    assert!(a.open_array().is_locked());

    assert!(a.close());
    assert!(!a.close());
    assert_eq!(open_count(&context, &uri), 1);
    drop(a);
    assert_eq!(open_count(&context, &uri), 1);
    drop(b);
    assert_eq!(open_count(&context, &uri), 0);
    assert!(context.registry().open_arrays().is_empty());

    let missing = base_uri(&path).join("missing").unwrap();
    assert!(matches!(
        context.open_array(&missing),
        Err(ContextError::Registry(RegistryError::NotFound(_)))
    ));
    assert!(context.registry().open_arrays().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn registry_concurrent_open_close() {
    let path = tempfile::TempDir::new().unwrap();
    let context = Context::new(Config::default()).unwrap();
    let arrays: Vec<_> = ["a", "b"]
        .iter()
        .map(|name| {
            let uri = base_uri(&path).join(name).unwrap();
            let fragments = create_array(&context, &uri, 4);
            (uri, fragments)
        })
        .collect();

    let held = context.open_array(&arrays[0].0).unwrap();
    (0..64).into_par_iter().for_each(|i| {
        let (uri, fragments) = &arrays[i % arrays.len()];
        let array = context.open_array(uri).unwrap();
        let fragment = &fragments[i % fragments.len()];
        let metadata = array.fragment_metadata(fragment).unwrap();
        assert_eq!(metadata.cell_count(), 1);
        if i % 3 == 0 {
            array.close();
        }
        drop(metadata);
    });

    assert_eq!(context.registry().open_arrays(), vec![arrays[0].0.clone()]);
    assert_eq!(open_count(&context, &arrays[0].0), 1);
    assert_eq!(held.open_array().referenced_fragment_metadata(), 0);
    drop(held);
    assert!(context.registry().open_arrays().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn registry_metadata_outlives_handle() {
    let path = tempfile::TempDir::new().unwrap();
    let context = Context::new(Config::default()).unwrap();
    let uri = base_uri(&path).join("array").unwrap();
    let fragments = create_array(&context, &uri, 2);

    let array: ArrayHandle = context.open_array(&uri).unwrap();
    let first = array.fragment_metadata(&fragments[0]).unwrap();
    let again = array.fragment_metadata(&fragments[0]).unwrap();
    assert_eq!(array.open_array().fragment_metadata_refs(&fragments[0]), Some(2));
    again.release();

    // Closed handles can not fetch, but outstanding references keep the record alive
    array.close();
    assert!(matches!(
        array.fragment_metadata(&fragments[1]),
        Err(RegistryError::Closed(_))
    ));
    assert_eq!(context.registry().open_arrays(), vec![uri.clone()]);
    assert_eq!(open_count(&context, &uri), 0);
    assert_eq!(first.non_empty_domain(), [0, 0]);
    drop(first);
    assert!(context.registry().open_arrays().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn registry_invalidate_while_referenced() {
    let path = tempfile::TempDir::new().unwrap();
    let context = Context::new(Config::default()).unwrap();
    let uri = base_uri(&path).join("array").unwrap();
    let fragments = create_array(&context, &uri, 1);

    let array = context.open_array(&uri).unwrap();
    let metadata = array.fragment_metadata(&fragments[0]).unwrap();
    array.invalidate_fragment_metadata(&fragments[0]);
    assert_eq!(array.open_array().fragment_metadata_refs(&fragments[0]), None);
    assert_eq!(metadata.cell_count(), 1);

    let refetched = array.fragment_metadata(&fragments[0]).unwrap();
    assert_eq!(array.open_array().fragment_metadata_refs(&fragments[0]), Some(1));
    drop(metadata);
    assert_eq!(array.open_array().fragment_metadata_refs(&fragments[0]), Some(1));
    drop(refetched);
    assert_eq!(array.open_array().fragment_metadata_refs(&fragments[0]), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn registry_fragment_metadata_retention() {
    let path = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.set_registry_fragment_metadata_retention(2);
    let context = Context::new(config).unwrap();
    let uri = base_uri(&path).join("array").unwrap();
    let fragments = create_array(&context, &uri, 3);

    let array = context.open_array(&uri).unwrap();
    for fragment in &fragments {
        array.fragment_metadata(fragment).unwrap().release();
    }
    assert_eq!(array.open_array().referenced_fragment_metadata(), 0);
    assert_eq!(array.open_array().retained_fragment_metadata(), 2);

    // Retained entries are reused without touching storage
    context.cache().clear();
    std::fs::remove_dir_all(path.path().join("array/__fragments")).unwrap();
    let metadata = array.fragment_metadata(&fragments[2]).unwrap();
    assert_eq!(metadata.cell_count(), 1);
    assert!(array.fragment_metadata(&fragments[0]).is_err());
    drop(metadata);

    drop(array);
    assert!(context.registry().open_arrays().is_empty());
}
