use std::io::SeekFrom;

use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use crate::{
    AccessMode, BlockCacheConfig, BlockCacheStream, BufferStream, ChsAddress, DiskFormat,
    Geometry, MemoryLocator, Ownership, SharedStream, SparseMemoryBuffer, SparseStream,
    VirtualDisk,
};

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Clear { offset: u32, len: u32 },
    Flush,
    Reopen,
}

const SECTOR: u32 = 512;
const MAX_DISK_SECTORS: u32 = 512; // 256 KiB
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 8 * 1024;

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR)
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let any = 0u32..=disk_size;
    let sector_aligned = (0u32..=disk_size / SECTOR).prop_map(|lba| lba * SECTOR);
    let near_end = (0u32..=SECTOR).prop_map(move |delta| disk_size.saturating_sub(delta));
    prop_oneof![
        4 => any,
        2 => sector_aligned,
        1 => near_end,
    ]
    .boxed()
}

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    let write = offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data });
    let read = offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len });
    let clear = offset_strategy(disk_size)
        .prop_flat_map(move |offset| (Just(offset), 0u32..=(disk_size - offset)))
        .prop_map(|(offset, len)| Op::Clear { offset, len });

    prop_oneof![
        5 => write,
        4 => read,
        2 => clear,
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn scenario_strategy() -> BoxedStrategy<(u32, Vec<Op>)> {
    disk_size_strategy()
        .prop_flat_map(|disk_size| {
            (
                Just(disk_size),
                prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS),
            )
        })
        .boxed()
}

/// Something that exposes a stream and can be closed and reopened over the same storage.
trait Subject: Sized {
    fn stream(&mut self) -> &mut dyn SparseStream;
    fn reopen(self) -> Self;
}

impl Subject for BufferStream<SparseMemoryBuffer> {
    fn stream(&mut self) -> &mut dyn SparseStream {
        self
    }

    fn reopen(self) -> Self {
        BufferStream::new(self.into_buffer(), AccessMode::ReadWrite).unwrap()
    }
}

struct Cached {
    stream: BlockCacheStream<BufferStream<SparseMemoryBuffer>>,
    config: BlockCacheConfig,
}

impl Subject for Cached {
    fn stream(&mut self) -> &mut dyn SparseStream {
        &mut self.stream
    }

    fn reopen(self) -> Self {
        let stream = BlockCacheStream::new(self.stream.into_inner(), self.config).unwrap();
        Self {
            stream,
            config: self.config,
        }
    }
}

struct Differencing {
    disk: VirtualDisk,
    child: SharedStream,
    locator: MemoryLocator,
}

impl Subject for Differencing {
    fn stream(&mut self) -> &mut dyn SparseStream {
        self.disk.content().unwrap().as_mut()
    }

    fn reopen(mut self) -> Self {
        self.disk.close().unwrap();
        let disk = VirtualDisk::open(
            self.child.share(),
            Ownership::Owns,
            AccessMode::ReadWrite,
            &mut self.locator,
        )
        .unwrap();
        assert_eq!(disk.layers().len(), 2);
        Self { disk, ..self }
    }
}

fn assert_extents_cover_data(stream: &mut dyn SparseStream, model: &[u8]) -> TestCaseResult {
    let extents = stream.extents().unwrap();
    for extent in &extents {
        prop_assert!(extent.end() <= model.len() as u64);
    }
    for (offset, byte) in model.iter().enumerate() {
        if *byte != 0 {
            let offset = offset as u64;
            prop_assert!(
                extents.iter().any(|e| e.contains(offset)),
                "byte {} holds data but lies outside every extent",
                offset
            );
        }
    }
    Ok(())
}

fn run_ops<T: Subject>(mut subject: T, mut model: Vec<u8>, ops: &[Op]) -> TestCaseResult {
    let capacity = model.len() as u64;
    prop_assert_eq!(subject.stream().len(), capacity);

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                let stream = subject.stream();
                stream.write_at(offset as u64, data).unwrap();
                model[offset..offset + data.len()].copy_from_slice(data);

                let mut read_back = vec![0xA5u8; data.len()];
                stream.read_exact_at(offset as u64, &mut read_back).unwrap();
                prop_assert_eq!(read_back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let mut buf = vec![0xA5u8; *len];
                subject
                    .stream()
                    .read_exact_at(offset as u64, &mut buf)
                    .unwrap();
                prop_assert_eq!(buf.as_slice(), &model[offset..offset + len]);
            }
            Op::Clear { offset, len } => {
                let stream = subject.stream();
                stream.seek(SeekFrom::Start(*offset as u64)).unwrap();
                stream.clear(*len as u64).unwrap();
                let offset = *offset as usize;
                model[offset..offset + *len as usize].fill(0);
            }
            Op::Flush => subject.stream().flush().unwrap(),
            Op::Reopen => {
                subject.stream().flush().unwrap();
                subject = subject.reopen();
                prop_assert_eq!(subject.stream().len(), capacity);
            }
        }
    }

    subject.stream().flush().unwrap();
    subject = subject.reopen();

    let mut all = vec![0u8; model.len()];
    subject.stream().read_exact_at(0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model.as_slice());
    assert_extents_cover_data(subject.stream(), &model)
}

fn base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

fn memory_stream(disk_size: u32) -> BufferStream<SparseMemoryBuffer> {
    let buffer = SparseMemoryBuffer::with_chunk_size(4096);
    let mut stream = BufferStream::new(buffer, AccessMode::ReadWrite).unwrap();
    stream.set_len(disk_size as u64).unwrap();
    stream
}

fn differencing_disk(disk_size: u32, seed: u8) -> (Differencing, SharedStream, Vec<u8>) {
    let base_store = SharedStream::new(BufferStream::memory());
    let child_store = SharedStream::new(BufferStream::memory());

    let mut base = VirtualDisk::initialize(
        base_store.share(),
        Ownership::Owns,
        DiskFormat::Sparse,
        disk_size as u64,
        None,
    )
    .unwrap();
    let pattern = base_pattern(disk_size as usize, seed);
    base.content().unwrap().write_at(0, &pattern).unwrap();

    let disk = base
        .create_differencing(child_store.share(), Ownership::Owns, "base.svd")
        .unwrap();
    let mut locator = MemoryLocator::new();
    locator.insert("base.svd", base_store.share());

    let subject = Differencing {
        disk,
        child: child_store,
        locator,
    };
    (subject, base_store, pattern)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_sparse_memory_stream_matches_reference((disk_size, ops) in scenario_strategy()) {
        let stream = memory_stream(disk_size);
        run_ops(stream, vec![0u8; disk_size as usize], &ops)?;
    }

    #[test]
    fn prop_block_cache_matches_reference(
        (disk_size, ops) in scenario_strategy(),
        block_size in prop_oneof![Just(512usize), Just(1024usize), Just(4096usize)],
        max_cached_blocks in 1usize..=3,
    ) {
        let config = BlockCacheConfig { block_size, max_cached_blocks };
        let stream = BlockCacheStream::new(memory_stream(disk_size), config).unwrap();
        run_ops(Cached { stream, config }, vec![0u8; disk_size as usize], &ops)?;
    }

    #[test]
    fn prop_differencing_disk_matches_reference(
        (disk_size, ops) in scenario_strategy(),
        seed in any::<u8>(),
    ) {
        let (subject, base_store, pattern) = differencing_disk(disk_size, seed);
        run_ops(subject, pattern.clone(), &ops)?;

        // The parent is never written through a child.
        let mut base = VirtualDisk::open(
            base_store,
            Ownership::Owns,
            AccessMode::Read,
            &mut crate::NoLocator,
        )
        .unwrap();
        let mut all = vec![0u8; pattern.len()];
        base.content().unwrap().read_exact_at(0, &mut all).unwrap();
        prop_assert_eq!(all, pattern);
    }

    #[test]
    fn prop_bios_allocations_never_overlap(
        ops in prop::collection::vec(table_op_strategy(), 1..=24),
    ) {
        run_table_ops(TableHarness::bios(), ops)?;
    }

    #[test]
    fn prop_gpt_allocations_never_overlap(
        ops in prop::collection::vec(table_op_strategy(), 1..=24),
    ) {
        run_table_ops(TableHarness::gpt(), ops)?;
    }

    #[test]
    fn prop_pc98_allocations_never_overlap(
        ops in prop::collection::vec(table_op_strategy(), 1..=24),
    ) {
        run_table_ops(TableHarness::pc98(), ops)?;
    }

    #[test]
    fn prop_chs_lba_bijection((geometry, chs) in chs_strategy()) {
        let lba = geometry.to_lba(chs).unwrap();
        prop_assert!(lba < geometry.total_sectors());
        prop_assert_eq!(geometry.to_chs(lba), chs);
    }

    #[test]
    fn prop_lba_chs_bijection(
        (geometry, lba) in chs_strategy().prop_flat_map(|(g, _)| (Just(g), 0..g.total_sectors())),
    ) {
        let chs = geometry.to_chs(lba);
        prop_assert!(geometry.contains(chs));
        prop_assert_eq!(geometry.to_lba(chs).unwrap(), lba);
    }

    #[test]
    fn prop_sealed_gpt_header_fields_never_panic(
        at in (3usize..11).prop_map(|word| word * 8),
        value in any::<u64>(),
        backup_too in any::<bool>(),
    ) {
        let mut stream = malformed::gpt_disk();
        let total = stream.len() / 512;
        malformed::patch_gpt_header(&mut stream, 1, at, value);
        if backup_too {
            malformed::patch_gpt_header(&mut stream, total - 1, at, value);
        }
        malformed::check_table_is_sane(stream)?;
    }

    #[test]
    fn prop_random_boot_sectors_never_panic(
        boot in prop::collection::vec(any::<u8>(), 512),
        directory in prop::collection::vec(any::<u8>(), 512),
        signed in any::<bool>(),
    ) {
        let mut stream = BufferStream::memory();
        stream.set_len(2 * 1024 * 1024).unwrap();
        let mut boot = boot;
        if signed {
            boot[510] = 0x55;
            boot[511] = 0xAA;
        }
        stream.write_at(0, &boot).unwrap();
        stream.write_at(512, &directory).unwrap();
        malformed::check_table_is_sane(stream)?;
    }

    #[test]
    fn prop_sealed_sparse_header_fields_never_panic(
        at in (2usize..23).prop_map(|word| word * 4),
        value in any::<u32>(),
    ) {
        let store = SharedStream::new(BufferStream::memory());
        let mut disk = VirtualDisk::initialize(
            store.share(),
            Ownership::Owns,
            DiskFormat::Sparse,
            1024 * 1024,
            None,
        )
        .unwrap();
        disk.content().unwrap().write_at(70_000, b"data").unwrap();
        disk.close().unwrap();

        malformed::patch_sparse_header(&store, at, value);
        if let Ok(mut disk) = VirtualDisk::open(
            store,
            Ownership::Owns,
            AccessMode::Read,
            &mut crate::NoLocator,
        ) {
            let capacity = disk.capacity();
            if let Ok(content) = disk.content() {
                let mut buf = [0u8; 16];
                let _ = content.read_at(capacity.saturating_sub(8), &mut buf);
                let _ = content.extents();
            }
        }
    }
}

fn chs_strategy() -> BoxedStrategy<(Geometry, ChsAddress)> {
    (1u32..=1024, 1u32..=255, 1u32..=63)
        .prop_flat_map(|(c, h, s)| {
            (
                Just(Geometry::new(c, h, s)),
                (0..c, 0..h, 1..=s).prop_map(|(c, h, s)| ChsAddress::new(c, h, s)),
            )
        })
        .boxed()
}

#[derive(Debug, Clone)]
enum TableOp {
    CreateBySize { bytes: u64 },
    CreateAligned { bytes: u64, alignment: u64 },
    Delete { index: usize },
    SetActive { index: usize },
}

fn table_op_strategy() -> BoxedStrategy<TableOp> {
    prop_oneof![
        3 => (1u64..=3 * 1024 * 1024).prop_map(|bytes| TableOp::CreateBySize { bytes }),
        3 => (
            64 * 1024u64..=2 * 1024 * 1024,
            prop_oneof![Just(4096u64), Just(64 * 1024), Just(1024 * 1024)],
        )
            .prop_map(|(bytes, alignment)| TableOp::CreateAligned { bytes, alignment }),
        2 => (0usize..8).prop_map(|index| TableOp::Delete { index }),
        1 => (0usize..8).prop_map(|index| TableOp::SetActive { index }),
    ]
    .boxed()
}

fn run_table_ops(mut harness: TableHarness, ops: Vec<TableOp>) -> TestCaseResult {
    for op in ops {
        harness.apply(op);
        harness.check()?;
    }
    Ok(())
}

mod table_harness {
    use super::TableOp;
    use crate::partitions::{
        BiosPartitionTable, GptLayout, GuidPartitionTable, Pc98PartitionTable, PartitionTable,
    };
    use crate::{BufferStream, Geometry, SparseStream, WellKnownPartitionType};
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseResult;

    const HEADS: u32 = 16;
    const SECTORS: u32 = 63;
    const CYLINDERS: u32 = 16;

    /// A partition table plus the bounds every partition in it must respect.
    pub(crate) struct TableHarness {
        table: Box<dyn PartitionTable>,
        first_usable: u64,
        last_usable: u64,
        slots: usize,
        has_active_flag: bool,
    }

    fn blank_disk() -> (BufferStream<crate::SparseMemoryBuffer>, Geometry) {
        let geometry = Geometry::new(CYLINDERS, HEADS, SECTORS);
        let mut stream = BufferStream::memory();
        stream.set_len(geometry.capacity()).unwrap();
        (stream, geometry)
    }

    impl TableHarness {
        pub(crate) fn bios() -> Self {
            let (stream, geometry) = blank_disk();
            Self {
                table: Box::new(BiosPartitionTable::initialize(stream, geometry).unwrap()),
                first_usable: SECTORS as u64,
                last_usable: geometry.total_sectors() - 1,
                slots: 4,
                has_active_flag: true,
            }
        }

        pub(crate) fn gpt() -> Self {
            let (stream, geometry) = blank_disk();
            let layout = GptLayout {
                entry_count: 8,
                reserve_microsoft_partition: true,
            };
            let table = GuidPartitionTable::initialize_with(stream, geometry, layout).unwrap();
            Self {
                first_usable: table.first_usable(),
                last_usable: table.last_usable(),
                table: Box::new(table),
                slots: 8,
                has_active_flag: false,
            }
        }

        pub(crate) fn pc98() -> Self {
            let (stream, geometry) = blank_disk();
            Self {
                table: Box::new(Pc98PartitionTable::initialize(stream, geometry).unwrap()),
                first_usable: (HEADS * SECTORS) as u64,
                last_usable: geometry.total_sectors() - 1,
                slots: crate::partitions::pc98::SLOTS,
                has_active_flag: true,
            }
        }

        /// Applies `op`; failures such as a full directory are expected and ignored.
        pub(crate) fn apply(&mut self, op: TableOp) {
            let kind = WellKnownPartitionType::Linux;
            let _ = match op {
                TableOp::CreateBySize { bytes } => {
                    self.table.create_by_size(bytes, kind, false).map(drop)
                }
                TableOp::CreateAligned { bytes, alignment } => self
                    .table
                    .create_aligned(bytes, kind, false, alignment)
                    .map(drop),
                TableOp::Delete { index } => self.table.delete(index),
                TableOp::SetActive { index } => self.table.set_active_partition(index),
            };
        }

        pub(crate) fn check(&mut self) -> TestCaseResult {
            let mut parts = self.table.partitions().unwrap();
            prop_assert!(parts.len() <= self.slots);
            let active = parts.iter().filter(|p| p.is_active).count();
            prop_assert!(active <= usize::from(self.has_active_flag));
            parts.sort_by_key(|p| p.first_sector);
            for p in &parts {
                prop_assert!(p.first_sector <= p.last_sector);
                prop_assert!(p.first_sector >= self.first_usable);
                prop_assert!(p.last_sector <= self.last_usable);
            }
            for pair in parts.windows(2) {
                prop_assert!(pair[0].last_sector < pair[1].first_sector);
            }
            Ok(())
        }
    }
}

use table_harness::TableHarness;

mod malformed {
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseResult;

    use crate::partitions::{GuidPartitionTable, PartitionTable};
    use crate::util::put_u32;
    use crate::{
        open_partition_table, BufferStream, DetectionPolicy, Geometry, SharedStream,
        SparseMemoryBuffer, SparseStream, WellKnownPartitionType,
    };

    const MIB: u64 = 1024 * 1024;

    pub(crate) fn gpt_disk() -> BufferStream<SparseMemoryBuffer> {
        let mut stream = BufferStream::memory();
        stream.set_len(8 * MIB).unwrap();
        {
            let mut table =
                GuidPartitionTable::initialize(&mut stream, Geometry::from_capacity(8 * MIB))
                    .unwrap();
            table
                .create_by_size(MIB, WellKnownPartitionType::Linux, false)
                .unwrap();
        }
        stream
    }

    /// Writes `value` into the GPT header at `lba` and recomputes its CRC.
    pub(crate) fn patch_gpt_header(
        stream: &mut BufferStream<SparseMemoryBuffer>,
        lba: u64,
        at: usize,
        value: u64,
    ) {
        let mut sector = [0u8; 512];
        stream.read_exact_at(lba * 512, &mut sector).unwrap();
        sector[at..at + 8].copy_from_slice(&value.to_le_bytes());
        put_u32(&mut sector, 16, 0);
        let crc = crc32fast::hash(&sector[..92]);
        put_u32(&mut sector, 16, crc);
        stream.write_at(lba * 512, &sector).unwrap();
    }

    /// Writes `value` into the sparse image header and recomputes its CRC.
    pub(crate) fn patch_sparse_header(store: &SharedStream, at: usize, value: u32) {
        let mut store = store.share();
        let mut header = [0u8; 512];
        store.read_exact_at(0, &mut header).unwrap();
        put_u32(&mut header, at, value);
        put_u32(&mut header, 92, 0);
        let crc = crc32fast::hash(&header);
        put_u32(&mut header, 92, crc);
        store.write_at(0, &header).unwrap();
    }

    /// Detection and parsing may reject the disk, but whatever they accept is well formed.
    pub(crate) fn check_table_is_sane(stream: BufferStream<SparseMemoryBuffer>) -> TestCaseResult {
        let len = stream.len();
        let Ok(Some(mut table)) = open_partition_table(stream, DetectionPolicy::default()) else {
            return Ok(());
        };
        let Ok(parts) = table.partitions() else {
            return Ok(());
        };
        for (index, p) in parts.iter().enumerate() {
            prop_assert!(p.first_sector <= p.last_sector);
            if let Ok(mut view) = table.open_partition(index) {
                prop_assert!(view.len() <= len);
                let mut byte = [0u8; 1];
                let _ = view.read_at(0, &mut byte);
            }
        }
        Ok(())
    }
}
