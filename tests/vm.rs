//! End-to-end exercises through the thread-safe façades.

use vmem::{
    AccessType, MemPartition, PAGE_SIZE, Partition, PhysAddr, Status, VirtAddr, VmProcess,
    VmSystem,
};

fn system(frames: usize) -> VmSystem {
    VmSystem::new(frames, 64, Box::new(MemPartition::new(64)))
}

/// Read one page, handling a fault the way a CPU loop would.
fn read_page(sys: &VmSystem, proc: &VmProcess, va: VirtAddr) -> Vec<u8> {
    match proc.access(va, AccessType::Read) {
        Status::Ok => {}
        Status::PageFault => {
            assert_eq!(proc.page_fault(va), Status::Ok);
            assert_eq!(proc.access(va, AccessType::Read), Status::Ok);
        }
        Status::Trap => panic!("read access trapped at {va:?}"),
    }
    let pa = proc.physical_address(va).unwrap();
    let mut buf = vec![0u8; PAGE_SIZE];
    sys.read_physical(pa, &mut buf);
    buf
}

/// Write bytes at `va`, handling a fault and marking the page dirty through
/// the access check.
fn write_at(sys: &VmSystem, proc: &VmProcess, va: VirtAddr, bytes: &[u8]) {
    match proc.access(va, AccessType::Write) {
        Status::Ok => {}
        Status::PageFault => {
            assert_eq!(proc.page_fault(va), Status::Ok);
            assert_eq!(proc.access(va, AccessType::Write), Status::Ok);
        }
        Status::Trap => panic!("write access trapped at {va:?}"),
    }
    let pa = proc.physical_address(va).unwrap();
    sys.write_physical(pa, bytes);
}

fn patterned(pages: usize) -> Vec<u8> {
    (0..pages)
        .flat_map(|i| std::iter::repeat_n(i as u8 + 1, PAGE_SIZE))
        .collect()
}

#[test]
fn pages_map_to_distinct_frames_and_keep_offsets() {
    let sys = system(8);
    let proc = sys.create_process();
    assert_eq!(
        proc.create_segment(VirtAddr(0x4000), 2, AccessType::ReadWrite),
        Status::Ok
    );

    let pa0 = proc.physical_address(VirtAddr(0x4000)).unwrap();
    let pa1 = proc.physical_address(VirtAddr(0x4000 + PAGE_SIZE)).unwrap();
    assert_ne!(pa0.frame(), pa1.frame());

    let off = proc.physical_address(VirtAddr(0x4000 + 5)).unwrap();
    assert_eq!(off, PhysAddr(pa0.bits() + 5));
}

#[test]
fn loaded_content_reads_back() {
    let sys = system(8);
    let proc = sys.create_process();
    let content = patterned(3);
    assert_eq!(
        proc.load_segment(VirtAddr(0), 3, AccessType::Read, &content),
        Status::Ok
    );
    for i in 0..3 {
        let page = read_page(&sys, &proc, VirtAddr(i * PAGE_SIZE));
        assert_eq!(page, content[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
    }
}

#[test]
fn created_pages_start_zeroed() {
    let sys = system(4);
    let proc = sys.create_process();
    assert_eq!(
        proc.create_segment(VirtAddr(0), 1, AccessType::ReadWrite),
        Status::Ok
    );
    assert!(read_page(&sys, &proc, VirtAddr(0)).iter().all(|&b| b == 0));
}

#[test]
fn delete_then_recreate_at_same_address() {
    let sys = system(4);
    let proc = sys.create_process();
    assert_eq!(
        proc.create_segment(VirtAddr(0x8000), 3, AccessType::ReadWrite),
        Status::Ok
    );
    assert_eq!(proc.delete_segment(VirtAddr(0x8000)), Status::Ok);
    assert_eq!(proc.access(VirtAddr(0x8000), AccessType::Read), Status::Trap);

    // all four frames must be reclaimable without eviction
    assert_eq!(
        proc.create_segment(VirtAddr(0x8000), 4, AccessType::ReadWrite),
        Status::Ok
    );
}

#[test]
fn segment_validation_traps() {
    let sys = system(4);
    let proc = sys.create_process();
    // not page aligned
    assert_eq!(
        proc.create_segment(VirtAddr(3), 1, AccessType::Read),
        Status::Trap
    );
    // zero pages
    assert_eq!(
        proc.create_segment(VirtAddr(0), 0, AccessType::Read),
        Status::Trap
    );
    // past the 24-bit ceiling
    assert_eq!(
        proc.create_segment(VirtAddr(0xFF_FC00), 2, AccessType::Read),
        Status::Trap
    );
    // the very last page is still in range
    assert_eq!(
        proc.create_segment(VirtAddr(0xFF_FC00), 1, AccessType::Read),
        Status::Ok
    );
    // overlap
    assert_eq!(
        proc.create_segment(VirtAddr(0xFF_FC00), 1, AccessType::Read),
        Status::Trap
    );
}

#[test]
fn delete_requires_the_segment_start() {
    let sys = system(4);
    let proc = sys.create_process();
    assert_eq!(
        proc.create_segment(VirtAddr(0), 2, AccessType::Read),
        Status::Ok
    );
    assert_eq!(proc.delete_segment(VirtAddr(PAGE_SIZE)), Status::Trap);
    assert_eq!(proc.delete_segment(VirtAddr(0x10000)), Status::Trap);
    assert_eq!(proc.delete_segment(VirtAddr(0)), Status::Ok);
}

#[test]
fn access_rights_are_enforced() {
    let sys = system(8);
    let proc = sys.create_process();
    proc.create_segment(VirtAddr(0), 1, AccessType::Read);
    proc.create_segment(VirtAddr(0x20000), 1, AccessType::ReadWrite);
    proc.create_segment(VirtAddr(0x40000), 1, AccessType::Execute);

    assert_eq!(proc.access(VirtAddr(0), AccessType::Read), Status::Ok);
    assert_eq!(proc.access(VirtAddr(0), AccessType::Write), Status::Trap);

    assert_eq!(proc.access(VirtAddr(0x20000), AccessType::Read), Status::Ok);
    assert_eq!(proc.access(VirtAddr(0x20000), AccessType::Write), Status::Ok);
    assert_eq!(
        proc.access(VirtAddr(0x20000), AccessType::Execute),
        Status::Trap
    );

    assert_eq!(
        proc.access(VirtAddr(0x40000), AccessType::Execute),
        Status::Ok
    );
    assert_eq!(proc.access(VirtAddr(0x40000), AccessType::Read), Status::Trap);
}

#[test]
fn unallocated_access_traps_but_missing_tables_fault() {
    let sys = system(4);
    let proc = sys.create_process();
    // no table levels exist at all yet: recoverable
    assert_eq!(proc.access(VirtAddr(0), AccessType::Read), Status::PageFault);
    // but fault handling then reports the page was never allocated
    assert_eq!(proc.page_fault(VirtAddr(0)), Status::Trap);

    proc.create_segment(VirtAddr(0), 1, AccessType::Read);
    // same level-2 table, unallocated slot: a trap
    assert_eq!(
        proc.access(VirtAddr(PAGE_SIZE), AccessType::Read),
        Status::Trap
    );
}

#[test]
fn eviction_round_trips_through_the_partition() {
    let sys = system(4);
    let proc = sys.create_process();
    let content = patterned(6);
    assert_eq!(
        proc.load_segment(VirtAddr(0), 6, AccessType::ReadWrite, &content),
        Status::Ok
    );

    // only 4 frames exist, so at least two pages were swapped out; every
    // page must still read back with its original content
    for i in 0..6 {
        let page = read_page(&sys, &proc, VirtAddr(i * PAGE_SIZE));
        assert_eq!(
            page,
            content[i * PAGE_SIZE..(i + 1) * PAGE_SIZE],
            "page {i} lost its content"
        );
    }
}

#[test]
fn rewritten_page_survives_a_second_eviction() {
    let sys = system(2);
    let proc = sys.create_process();
    proc.create_segment(VirtAddr(0), 1, AccessType::ReadWrite);
    write_at(&sys, &proc, VirtAddr(0), b"first");

    // push it out, pull it back, overwrite, push it out again
    proc.create_segment(VirtAddr(0x20000), 2, AccessType::ReadWrite);
    write_at(&sys, &proc, VirtAddr(0), b"second");
    write_at(&sys, &proc, VirtAddr(0x20000), &[1; 8]);
    write_at(&sys, &proc, VirtAddr(0x20000 + PAGE_SIZE), &[2; 8]);

    let page = read_page(&sys, &proc, VirtAddr(0));
    assert_eq!(&page[..6], b"second");
}

#[test]
fn shared_segment_aliases_one_set_of_frames() {
    let sys = system(8);
    let p1 = sys.create_process();
    let p2 = sys.create_process();

    assert_eq!(
        p1.create_shared_segment(VirtAddr(0x10000), 2, "board", AccessType::ReadWrite),
        Status::Ok
    );
    assert_eq!(
        p2.create_shared_segment(VirtAddr(0x80000), 2, "board", AccessType::ReadWrite),
        Status::Ok
    );

    let pa1 = p1.physical_address(VirtAddr(0x10000)).unwrap();
    let pa2 = p2.physical_address(VirtAddr(0x80000)).unwrap();
    assert_eq!(pa1, pa2);

    write_at(&sys, &p1, VirtAddr(0x10000 + PAGE_SIZE), b"from p1");
    let seen = read_page(&sys, &p2, VirtAddr(0x80000 + PAGE_SIZE));
    assert_eq!(&seen[..7], b"from p1");
}

#[test]
fn shared_attach_validates_size_and_rights() {
    let sys = system(8);
    let p1 = sys.create_process();
    let p2 = sys.create_process();

    p1.create_shared_segment(VirtAddr(0), 2, "strict", AccessType::Read);
    assert_eq!(
        p2.create_shared_segment(VirtAddr(0), 3, "strict", AccessType::Read),
        Status::Trap
    );
    assert_eq!(
        p2.create_shared_segment(VirtAddr(0), 2, "strict", AccessType::Write),
        Status::Trap
    );
    assert_eq!(
        p2.create_shared_segment(VirtAddr(0), 2, "strict", AccessType::Read),
        Status::Ok
    );

    // READ_WRITE segments accept weaker attachments
    p1.create_shared_segment(VirtAddr(0x40000), 1, "loose", AccessType::ReadWrite);
    assert_eq!(
        p2.create_shared_segment(VirtAddr(0x40000), 1, "loose", AccessType::Read),
        Status::Ok
    );
    // and the weaker attachment is held to its own rights
    assert_eq!(p2.access(VirtAddr(0x40000), AccessType::Write), Status::Trap);
    assert_eq!(p1.access(VirtAddr(0x40000), AccessType::Write), Status::Ok);
}

#[test]
fn shared_segment_larger_than_the_frame_pool() {
    let sys = VmSystem::new(2, 64, Box::new(MemPartition::new(16)));
    let proc = sys.create_process();
    // creating 3 canonical pages on 2 frames evicts mid-creation; the pages
    // granted so far must stay visible to the victim-owner scan
    assert_eq!(
        proc.create_shared_segment(VirtAddr(0), 3, "big", AccessType::ReadWrite),
        Status::Ok
    );
    for i in 0..3 {
        write_at(&sys, &proc, VirtAddr(i * PAGE_SIZE), &[i as u8 + 1; 16]);
    }
    for i in 0..3 {
        let page = read_page(&sys, &proc, VirtAddr(i * PAGE_SIZE));
        assert_eq!(
            &page[..16],
            &[i as u8 + 1; 16],
            "shared page {i} lost its content"
        );
    }
}

#[test]
fn failed_shared_creation_leaves_no_registry_entry() {
    let sys = VmSystem::new(1, 64, Box::new(MemPartition::new(0)));
    let proc = sys.create_process();
    let content = vec![5u8; PAGE_SIZE];
    proc.load_segment(VirtAddr(0), 1, AccessType::ReadWrite, &content);

    // eviction of the dirty page has no cluster to go to, so the creation
    // dies on its first frame; nothing may stay half-registered
    assert_eq!(
        proc.create_shared_segment(VirtAddr(0x20000), 1, "shm", AccessType::ReadWrite),
        Status::Trap
    );
    assert_eq!(sys.delete_shared_segment("shm"), Status::Trap);

    assert_eq!(proc.delete_segment(VirtAddr(0)), Status::Ok);
    assert_eq!(
        proc.create_shared_segment(VirtAddr(0x20000), 1, "shm", AccessType::ReadWrite),
        Status::Ok
    );
}

#[test]
fn failed_attach_unwinds_the_alias_slots() {
    // pool sized so the attacher's first level-2 node fits but not a second
    let sys = VmSystem::new(8, 7, Box::new(MemPartition::new(16)));
    let p1 = sys.create_process();
    let p2 = sys.create_process();
    assert_eq!(
        p1.create_shared_segment(VirtAddr(0), 2, "shm", AccessType::ReadWrite),
        Status::Ok
    );

    // the attachment crosses a level-1 boundary and dies on the second node
    let start = VirtAddr(127 * PAGE_SIZE);
    assert_eq!(
        p2.create_shared_segment(start, 2, "shm", AccessType::ReadWrite),
        Status::Trap
    );
    // no half-attached state: the first alias slot is gone again and the
    // registry agrees the process is not attached
    assert_eq!(p2.page_fault(start), Status::Trap);
    assert_eq!(p2.disconnect_shared_segment("shm"), Status::Trap);

    // the unwound table space is enough for a clean retry elsewhere
    assert_eq!(
        p2.create_shared_segment(VirtAddr(0x20000), 2, "shm", AccessType::ReadWrite),
        Status::Ok
    );
}

#[test]
fn disconnect_detaches_only_the_caller() {
    let sys = system(8);
    let p1 = sys.create_process();
    let p2 = sys.create_process();
    p1.create_shared_segment(VirtAddr(0), 1, "shm", AccessType::ReadWrite);
    p2.create_shared_segment(VirtAddr(0), 1, "shm", AccessType::ReadWrite);

    assert_eq!(p2.disconnect_shared_segment("shm"), Status::Ok);
    assert_eq!(p2.access(VirtAddr(0), AccessType::Read), Status::Trap);
    assert_eq!(p1.access(VirtAddr(0), AccessType::Read), Status::Ok);

    assert_eq!(p2.disconnect_shared_segment("shm"), Status::Trap);
}

#[test]
fn delete_shared_segment_detaches_everyone_and_frees_the_name() {
    let sys = system(4);
    let p1 = sys.create_process();
    let p2 = sys.create_process();
    p1.create_shared_segment(VirtAddr(0), 2, "shm", AccessType::ReadWrite);
    p2.create_shared_segment(VirtAddr(0x20000), 2, "shm", AccessType::ReadWrite);

    assert_eq!(sys.delete_shared_segment("shm"), Status::Ok);
    assert_eq!(p1.access(VirtAddr(0), AccessType::Read), Status::Trap);
    assert_eq!(p2.access(VirtAddr(0x20000), AccessType::Read), Status::Trap);
    assert_eq!(sys.delete_shared_segment("shm"), Status::Trap);

    // name and frames are both reusable; 2 of 4 frames would leak otherwise
    assert_eq!(
        p1.create_shared_segment(VirtAddr(0), 4, "shm", AccessType::Read),
        Status::Ok
    );
}

#[test]
fn clone_copies_private_pages() {
    let sys = system(8);
    let parent = sys.create_process();
    let content = patterned(2);
    parent.load_segment(VirtAddr(0), 2, AccessType::ReadWrite, &content);

    let child = sys.clone_process(&parent).unwrap();
    write_at(&sys, &parent, VirtAddr(0), b"parent scribble");

    // the child kept the pre-clone content
    let page = read_page(&sys, &child, VirtAddr(0));
    assert_eq!(page, content[..PAGE_SIZE]);
    // and the parent kept its own write
    let page = read_page(&sys, &parent, VirtAddr(0));
    assert_eq!(&page[..15], b"parent scribble");
}

#[test]
fn clone_shares_shared_segments() {
    let sys = system(8);
    let parent = sys.create_process();
    parent.create_shared_segment(VirtAddr(0x10000), 1, "shm", AccessType::ReadWrite);

    let child = sys.clone_process(&parent).unwrap();
    write_at(&sys, &child, VirtAddr(0x10000), b"from child");
    let seen = read_page(&sys, &parent, VirtAddr(0x10000));
    assert_eq!(&seen[..10], b"from child");
}

#[test]
fn clone_reproduces_swapped_out_pages() {
    let sys = system(4);
    let parent = sys.create_process();
    let content = patterned(6);
    parent.load_segment(VirtAddr(0), 6, AccessType::ReadWrite, &content);

    // cloning 6 pages into 4 frames forces heavy eviction on both sides
    let child = sys.clone_process(&parent).unwrap();
    for i in 0..6 {
        let page = read_page(&sys, &child, VirtAddr(i * PAGE_SIZE));
        assert_eq!(
            page,
            content[i * PAGE_SIZE..(i + 1) * PAGE_SIZE],
            "cloned page {i} lost its content"
        );
    }
}

#[test]
fn delete_process_releases_everything() {
    let sys = system(4);
    let p1 = sys.create_process();
    p1.create_segment(VirtAddr(0), 3, AccessType::ReadWrite);
    p1.create_shared_segment(VirtAddr(0x20000), 1, "shm", AccessType::ReadWrite);
    assert_eq!(sys.delete_process(p1), Status::Ok);

    // all four frames are free again: the shared page keeps its frame but
    // destroying the segment returns it too
    assert_eq!(sys.delete_shared_segment("shm"), Status::Ok);
    let p2 = sys.create_process();
    assert_eq!(
        p2.create_segment(VirtAddr(0), 4, AccessType::ReadWrite),
        Status::Ok
    );
}

#[test]
fn table_space_exhaustion_traps_without_rollback() {
    // room for the level-1 node and one level-2 node, not two
    let sys = VmSystem::new(8, 4, Box::new(MemPartition::new(8)));
    let proc = sys.create_process();

    // the run crosses a level-1 boundary, so the second page needs a
    // second level-2 node
    let start = VirtAddr(127 * PAGE_SIZE);
    assert_eq!(
        proc.create_segment(start, 2, AccessType::ReadWrite),
        Status::Trap
    );

    // no rollback: the first page stays allocated and usable
    assert_eq!(proc.access(start, AccessType::Read), Status::Ok);
    assert_eq!(proc.create_segment(start, 1, AccessType::Read), Status::Trap);
}

#[test]
fn cluster_exhaustion_traps_when_a_dirty_page_must_leave() {
    let sys = VmSystem::new(1, 64, Box::new(MemPartition::new(0)));
    let proc = sys.create_process();
    let content = vec![9u8; PAGE_SIZE];
    assert_eq!(
        proc.load_segment(VirtAddr(0), 1, AccessType::ReadWrite, &content),
        Status::Ok
    );
    // the only frame is dirty and there is nowhere to put it
    assert_eq!(
        proc.create_segment(VirtAddr(0x20000), 1, AccessType::Read),
        Status::Trap
    );
}

struct BrokenDisk;

impl Partition for BrokenDisk {
    fn cluster_count(&self) -> u32 {
        16
    }
    fn read_cluster(&mut self, _cluster: u32, _buf: &mut [u8]) -> bool {
        false
    }
    fn write_cluster(&mut self, _cluster: u32, _buf: &[u8]) -> bool {
        false
    }
}

#[test]
fn disk_write_failure_surfaces_as_a_trap() {
    let sys = VmSystem::new(1, 64, Box::new(BrokenDisk));
    let proc = sys.create_process();
    let content = vec![9u8; PAGE_SIZE];
    proc.load_segment(VirtAddr(0), 1, AccessType::ReadWrite, &content);
    assert_eq!(
        proc.create_segment(VirtAddr(0x20000), 1, AccessType::Read),
        Status::Trap
    );
}

#[test]
fn content_length_must_match_segment_size() {
    let sys = system(4);
    let proc = sys.create_process();
    assert_eq!(
        proc.load_segment(VirtAddr(0), 2, AccessType::Read, &[0; PAGE_SIZE]),
        Status::Trap
    );
}

#[test]
fn operations_serialize_across_threads() {
    let sys = system(16);
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let sys = sys.clone();
            std::thread::spawn(move || {
                let proc = sys.create_process();
                let start = VirtAddr(i * 0x20000);
                assert_eq!(
                    proc.create_segment(start, 2, AccessType::ReadWrite),
                    Status::Ok
                );
                write_at(&sys, &proc, start, &[i as u8; 16]);
                let page = read_page(&sys, &proc, start);
                assert_eq!(&page[..16], &[i as u8; 16]);
                assert_eq!(sys.delete_process(proc), Status::Ok);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
