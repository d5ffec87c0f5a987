use strata_disk::{
    AccessMode, BufferStream, DiskError, DiskFormat, FileStream, Geometry, MemoryLocator,
    NoLocator, Ownership, SharedStream, SparseStream, VirtualDisk, VirtualDiskLayer,
};

const MIB: u64 = 1024 * 1024;

fn read_vec(disk: &mut VirtualDisk, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    disk.content()
        .unwrap()
        .read_exact_at(offset, &mut buf)
        .unwrap();
    buf
}

fn sparse_base(store: &SharedStream, capacity: u64) -> VirtualDisk {
    VirtualDisk::initialize(
        store.share(),
        Ownership::Owns,
        DiskFormat::Sparse,
        capacity,
        None,
    )
    .unwrap()
}

#[test]
fn differencing_chain_resolves_each_block_from_the_nearest_layer() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let base_store = SharedStream::new(BufferStream::memory());
    let child_store = SharedStream::new(BufferStream::memory());
    let grand_store = SharedStream::new(BufferStream::memory());

    let mut base = sparse_base(&base_store, 4 * MIB);
    base.content().unwrap().write_at(0, b"base@0").unwrap();
    base.content().unwrap().write_at(MIB, b"base@1M").unwrap();

    let mut child = base
        .create_differencing(child_store.share(), Ownership::Owns, "base.svd")
        .unwrap();
    child.content().unwrap().write_at(MIB, b"child@1M").unwrap();

    let mut grand = child
        .create_differencing(grand_store.share(), Ownership::Owns, "child.svd")
        .unwrap();
    grand.content().unwrap().write_at(2 * MIB, b"grand@2M").unwrap();
    assert_eq!(grand.layers().len(), 3);
    grand.close().unwrap();

    let mut locator = MemoryLocator::new();
    locator.insert("base.svd", base_store.share());
    locator.insert("child.svd", child_store.share());
    let mut grand = VirtualDisk::open(
        grand_store.share(),
        Ownership::Owns,
        AccessMode::ReadWrite,
        &mut locator,
    )
    .unwrap();

    assert_eq!(grand.layers().len(), 3);
    assert!(grand.layers()[0].needs_parent());
    assert!(!grand.layers()[2].needs_parent());
    assert_eq!(grand.capacity(), 4 * MIB);
    assert_eq!(read_vec(&mut grand, 0, 6), b"base@0");
    assert_eq!(read_vec(&mut grand, MIB, 8), b"child@1M");
    assert_eq!(read_vec(&mut grand, 2 * MIB, 8), b"grand@2M");
    assert_eq!(read_vec(&mut grand, 3 * MIB, 4), [0u8; 4]);
    grand.close().unwrap();

    // Layers below the most-derived one are never written.
    let mut base = VirtualDisk::open(base_store, Ownership::Owns, AccessMode::Read, &mut NoLocator)
        .unwrap();
    assert_eq!(read_vec(&mut base, MIB, 7), b"base@1M");
    assert_eq!(read_vec(&mut base, 2 * MIB, 8), [0u8; 8]);
}

#[test]
fn differencing_extents_include_parent_data() {
    let base_store = SharedStream::new(BufferStream::memory());
    let mut base = sparse_base(&base_store, 4 * MIB);
    base.content().unwrap().write_at(0, &[1u8; 10]).unwrap();

    let mut child = base
        .create_differencing(
            BufferStream::memory(),
            Ownership::Owns,
            "base.svd",
        )
        .unwrap();
    child.content().unwrap().write_at(3 * MIB, &[2u8; 10]).unwrap();

    let extents = child.content().unwrap().extents().unwrap();
    assert!(extents.iter().any(|e| e.contains(0)));
    assert!(extents.iter().any(|e| e.contains(3 * MIB)));
    assert!(!extents.iter().any(|e| e.contains(2 * MIB)));
}

#[test]
fn missing_parent_is_reported_with_candidates() {
    let base_store = SharedStream::new(BufferStream::memory());
    let child_store = SharedStream::new(BufferStream::memory());
    let base = sparse_base(&base_store, MIB);
    let mut child = base
        .create_differencing(child_store.share(), Ownership::Owns, "gone.svd")
        .unwrap();
    child.close().unwrap();

    let err = VirtualDisk::open(
        child_store,
        Ownership::Owns,
        AccessMode::Read,
        &mut MemoryLocator::new(),
    )
    .err()
    .unwrap();
    assert_eq!(
        err,
        DiskError::ParentNotFound {
            layer: 0,
            candidates: vec!["gone.svd".to_owned()],
        }
    );
}

#[test]
fn raw_disks_cannot_have_children() {
    let raw = VirtualDisk::initialize(
        BufferStream::memory(),
        Ownership::Owns,
        DiskFormat::Raw,
        MIB,
        None,
    )
    .unwrap();
    let err = raw
        .create_differencing(BufferStream::memory(), Ownership::Owns, "raw.img")
        .err()
        .unwrap();
    assert_eq!(
        err,
        DiskError::UnsupportedForFormat {
            format: "raw",
            operation: "differencing",
        }
    );
}

#[test]
fn sparse_layer_records_geometry() {
    let geometry = Geometry::new(100, 16, 63);
    let mut disk = VirtualDisk::initialize(
        BufferStream::memory(),
        Ownership::Owns,
        DiskFormat::Sparse,
        geometry.capacity(),
        Some(geometry),
    )
    .unwrap();
    assert_eq!(disk.geometry().unwrap(), geometry);
    assert_eq!(disk.layers()[0].geometry(), Some(geometry));
}

#[test]
fn read_only_disk_rejects_writes() {
    let store = SharedStream::new(BufferStream::memory());
    sparse_base(&store, MIB).close().unwrap();

    let mut disk =
        VirtualDisk::open(store, Ownership::Owns, AccessMode::Read, &mut NoLocator).unwrap();
    assert!(disk.is_read_only());
    assert!(matches!(
        disk.content().unwrap().write_at(0, b"x"),
        Err(DiskError::AccessDenied(_))
    ));
}

#[test]
fn file_backed_chain_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.svd");
    let child_path = dir.path().join("child.svd");

    let mut base = VirtualDisk::initialize(
        FileStream::create(&base_path).unwrap(),
        Ownership::Owns,
        DiskFormat::Sparse,
        8 * MIB,
        None,
    )
    .unwrap();
    base.content().unwrap().write_at(4096, b"persisted base").unwrap();
    base.close().unwrap();

    let base = VirtualDisk::open_file(&base_path, AccessMode::Read).unwrap();
    let mut child = base
        .create_differencing(
            FileStream::create(&child_path).unwrap(),
            Ownership::Owns,
            "base.svd",
        )
        .unwrap();
    child.content().unwrap().write_at(5 * MIB, b"persisted child").unwrap();
    child.close().unwrap();

    let mut child = VirtualDisk::open_file(&child_path, AccessMode::ReadWrite).unwrap();
    assert_eq!(child.layers().len(), 2);
    assert_eq!(child.format(), DiskFormat::Sparse);
    assert_eq!(read_vec(&mut child, 4096, 14), b"persisted base");
    assert_eq!(read_vec(&mut child, 5 * MIB, 15), b"persisted child");
    child.close().unwrap();
}
