//! Buffer creation, binding and memory queries against the null backend.

use std::sync::{Arc, Mutex};

use ember_core::{ChipFamily, ChipInfo};
use ember_surface::image::UnifiedLayout;
use ember_surface::{Extent3d, Format, Image, ImageAspects, Surface};
use ember_vulkan::{
    AddressBindingKind, AddressBindingReport, BindBufferMemoryInfo, BoundObject, BufferCreateFlags,
    BufferCreateInfo, BufferUsageFlags, Device, DeviceCreateInfo, DeviceFeatures, DriverConfig,
    ExternalMemoryHandleType, MemoryAllocateInfo, MemoryTraceToken, OverallocationBehavior,
    PhysicalDevice, SPARSE_PAGE_SIZE, SparseMemoryBind, TraceMode, VkError, VkResult,
};
use ember_winsys::{NullWinsys, WinsysCall};
use proptest::prelude::*;

/// Device-local, no CPU access
const TYPE_VRAM: u32 = 0;
/// Device-local, host visible
const TYPE_VISIBLE_VRAM: u32 = 2;
/// Device-local, 32-bit addressable
const TYPE_32BIT_MASK: u32 = 1 << 4;
const MIB: u64 = 1024 * 1024;

fn device_with(ws: &Arc<NullWinsys>, config: &DriverConfig, info: &DeviceCreateInfo) -> Device {
    let physical = Arc::new(PhysicalDevice::new(ws.clone(), ChipInfo::for_family(ChipFamily::Navi21)));
    Device::create(physical, config, info).unwrap()
}

fn device(ws: &Arc<NullWinsys>) -> Device {
    device_with(ws, &DriverConfig::default(), &DeviceCreateInfo::new())
}

fn sparse_info(size: u64) -> BufferCreateInfo {
    BufferCreateInfo::new(size, BufferUsageFlags::STORAGE_BUFFER)
        .with_flags(BufferCreateFlags::SPARSE_BINDING | BufferCreateFlags::SPARSE_RESIDENCY)
}

#[test]
fn sparse_buffer_reserves_page_aligned_range() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    let bos_before = ws.live_bo_count();

    let buffer = device.create_buffer(&sparse_info(10_000)).unwrap();
    assert!(buffer.is_sparse());
    let va = device.buffer_device_address(&buffer);
    assert_ne!(va, 0);
    assert_eq!(va % SPARSE_PAGE_SIZE, 0);
    assert_eq!(ws.live_bo_count(), bos_before + 1);

    device.destroy_buffer(Some(buffer));
    assert_eq!(ws.live_bo_count(), bos_before);
}

#[test]
fn sparse_descriptor_buffer_lands_in_low_4g() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    let info = BufferCreateInfo::new(8192, BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER)
        .with_flags(BufferCreateFlags::SPARSE_BINDING);
    let buffer = device.create_buffer(&info).unwrap();
    assert!(device.buffer_device_address(&buffer) < 1 << 32);
}

#[test]
fn sparse_reservation_failure_is_out_of_device_memory() {
    let ws = Arc::new(NullWinsys::new());
    let mut config = DriverConfig::default();
    config.trace = TraceMode::RMV;
    let device = device_with(&ws, &config, &DeviceCreateInfo::new());
    let bos_before = ws.live_bo_count();

    ws.fail_nth(WinsysCall::BufferCreate, 1);
    let err = device.create_buffer(&sparse_info(4096)).unwrap_err();
    assert_eq!(err, VkError::OutOfDeviceMemory);
    assert_eq!(ws.live_bo_count(), bos_before);
    assert!(
        !device
            .memory_trace_tokens()
            .iter()
            .any(|t| matches!(t, MemoryTraceToken::BufferCreate { .. }))
    );
}

#[test]
fn capture_replay_reuses_the_recorded_address() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    let info = sparse_info(65536).with_flags(
        BufferCreateFlags::SPARSE_BINDING | BufferCreateFlags::DEVICE_ADDRESS_CAPTURE_REPLAY,
    );

    let buffer = device.create_buffer(&info).unwrap();
    let captured = device.buffer_opaque_capture_address(&buffer);
    assert_ne!(captured, 0);
    device.destroy_buffer(Some(buffer));

    let replayed = device.create_buffer(&info.with_capture_address(captured)).unwrap();
    assert_eq!(device.buffer_device_address(&replayed), captured);
}

#[test]
fn sparse_binds_merge_contiguous_ranges() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    let buffer = device.create_buffer(&sparse_info(5 * SPARSE_PAGE_SIZE)).unwrap();
    let memory = device
        .allocate_memory(&MemoryAllocateInfo::new(4 * SPARSE_PAGE_SIZE, TYPE_VRAM))
        .unwrap();
    let page = SPARSE_PAGE_SIZE;

    let bind = |resource_offset, memory_offset| SparseMemoryBind {
        resource_offset,
        size: page,
        memory: Some(&memory),
        memory_offset,
    };
    let unbind = |resource_offset| SparseMemoryBind {
        resource_offset,
        size: page,
        memory: None,
        memory_offset: 0,
    };

    device
        .bind_sparse_buffer(
            &buffer,
            &[bind(0, 0), bind(page, page), bind(2 * page, 3 * page), unbind(3 * page), unbind(4 * page)],
        )
        .unwrap();

    let log = ws.virtual_bind_log();
    let memory_bo = Some(memory.bo().handle());
    let ranges: Vec<_> = log.iter().map(|r| (r.offset, r.size, r.bo, r.bo_offset)).collect();
    assert_eq!(
        ranges,
        vec![
            (0, 2 * page, memory_bo, 0),
            (2 * page, page, memory_bo, 3 * page),
            (3 * page, 2 * page, None, 0),
        ]
    );
}

#[test]
fn sparse_bind_errors() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);

    let plain = device
        .create_buffer(&BufferCreateInfo::new(4096, BufferUsageFlags::STORAGE_BUFFER))
        .unwrap();
    let past_end = SparseMemoryBind {
        resource_offset: 0,
        size: SPARSE_PAGE_SIZE,
        memory: None,
        memory_offset: 0,
    };
    assert_eq!(device.bind_sparse_buffer(&plain, &[past_end]), Err(VkError::Unknown));

    let sparse = device.create_buffer(&sparse_info(SPARSE_PAGE_SIZE)).unwrap();
    let past_end = SparseMemoryBind {
        resource_offset: SPARSE_PAGE_SIZE,
        ..past_end
    };
    assert!(device.bind_sparse_buffer(&sparse, &[past_end]).is_err());
    assert!(ws.virtual_bind_log().is_empty());
}

#[test]
fn batch_bind_continues_past_failures() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    let memory = device
        .allocate_memory(&MemoryAllocateInfo::new(4096, TYPE_VISIBLE_VRAM))
        .unwrap();
    let usage = BufferUsageFlags::UNIFORM_BUFFER;

    let mut a = device.create_buffer(&BufferCreateInfo::new(1024, usage)).unwrap();
    let mut b = device.create_buffer(&BufferCreateInfo::new(8192, usage)).unwrap();
    let mut c = device.create_buffer(&BufferCreateInfo::new(256, usage)).unwrap();
    let mut status = [VkResult::ErrorUnknown, VkResult::Success, VkResult::ErrorUnknown];
    let [sa, sb, sc] = &mut status;

    let result = device.bind_buffer_memory(&mut [
        BindBufferMemoryInfo::new(&mut a, &memory, 0).with_status(sa),
        BindBufferMemoryInfo::new(&mut b, &memory, 0).with_status(sb),
        BindBufferMemoryInfo::new(&mut c, &memory, 2048).with_status(sc),
    ]);

    // No rollback: the bind before the failed entry stays in place.
    assert_eq!(result, Err(VkError::Unknown));
    assert_eq!(status, [VkResult::Success, VkResult::ErrorUnknown, VkResult::Success]);

    let base = memory.bo().va().raw();
    assert_eq!(device.buffer_device_address(&a), base);
    assert_eq!(device.buffer_device_address(&b), 0);
    assert_eq!(b.bo_va(), 0);
    assert_eq!(device.buffer_device_address(&c), base + 2048);
    assert_eq!(c.offset(), 2048);
}

#[test]
fn bind_reports_bo_extent_to_callback() {
    let ws = Arc::new(NullWinsys::new());
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let info = DeviceCreateInfo::new().with_address_binding_callback(Arc::new(
        move |report: &AddressBindingReport| sink.lock().unwrap().push(*report),
    ));
    let device = device_with(&ws, &DriverConfig::default(), &info);

    let memory = device
        .allocate_memory(&MemoryAllocateInfo::new(8192, TYPE_VISIBLE_VRAM))
        .unwrap();
    let mut buffer = device
        .create_buffer(&BufferCreateInfo::new(100, BufferUsageFlags::STORAGE_BUFFER))
        .unwrap();
    let handle = buffer.handle();
    reports.lock().unwrap().clear();

    device
        .bind_buffer_memory(&mut [BindBufferMemoryInfo::new(&mut buffer, &memory, 256)])
        .unwrap();
    device.destroy_buffer(Some(buffer));

    let va = memory.bo().va().raw();
    assert_eq!(
        *reports.lock().unwrap(),
        vec![
            AddressBindingReport {
                object: BoundObject::Buffer(handle),
                address: va + 256,
                size: 8192,
                kind: AddressBindingKind::Bind,
            },
            AddressBindingReport {
                object: BoundObject::Buffer(handle),
                address: va + 256,
                size: 8192,
                kind: AddressBindingKind::Unbind,
            },
        ]
    );
}

#[test]
fn unbound_buffer_has_no_address() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    let buffer = device
        .create_buffer(&BufferCreateInfo::new(64, BufferUsageFlags::SHADER_DEVICE_ADDRESS))
        .unwrap();
    assert_eq!(device.buffer_device_address(&buffer), 0);
    assert_eq!(device.buffer_opaque_capture_address(&buffer), 0);
    device.destroy_buffer(None);
}

#[test]
fn descriptor_buffers_use_32bit_types() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);

    for usage in [
        BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER,
        BufferUsageFlags::SAMPLER_DESCRIPTOR_BUFFER | BufferUsageFlags::STORAGE_BUFFER,
    ] {
        let reqs = device.buffer_memory_requirements(100, BufferCreateFlags::empty(), usage);
        assert_eq!(reqs.memory_type_bits, TYPE_32BIT_MASK);
    }

    let indirect = BufferUsageFlags::INDIRECT_BUFFER;
    let plain = device.buffer_memory_requirements(100, BufferCreateFlags::empty(), indirect);
    assert_eq!(plain.memory_type_bits & TYPE_32BIT_MASK, 0);

    let dgc = DeviceCreateInfo::new().with_features(DeviceFeatures {
        device_generated_commands: true,
        ..DeviceFeatures::default()
    });
    let device = device_with(&ws, &DriverConfig::default(), &dgc);
    let reqs = device.buffer_memory_requirements(100, BufferCreateFlags::empty(), indirect);
    assert_ne!(reqs.memory_type_bits & TYPE_32BIT_MASK, 0);
}

fn usage_strategy() -> impl Strategy<Value = BufferUsageFlags> {
    any::<u64>().prop_map(BufferUsageFlags::from_bits_truncate)
}

proptest! {
    #[test]
    fn memory_requirements_are_aligned(
        size in 1u64..(1 << 40),
        sparse in any::<bool>(),
        usage in usage_strategy(),
    ) {
        let ws = Arc::new(NullWinsys::new());
        let device = device(&ws);
        let flags = if sparse { BufferCreateFlags::SPARSE_BINDING } else { BufferCreateFlags::empty() };
        let reqs = device.buffer_memory_requirements(size, flags, usage);

        prop_assert!(reqs.alignment.is_power_of_two());
        prop_assert_eq!(reqs.size % reqs.alignment, 0);
        prop_assert!(reqs.size >= size);
        prop_assert!(reqs.size - size < reqs.alignment);
        if sparse {
            prop_assert_eq!(reqs.alignment % SPARSE_PAGE_SIZE, 0);
        }
        if usage.contains(BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE) {
            prop_assert_eq!(reqs.alignment % 64, 0);
        }
        prop_assert_ne!(reqs.memory_type_bits, 0);
        prop_assert!(!reqs.requires_dedicated_allocation);
    }

    #[test]
    fn sparse_reservation_returns_its_range(size in 1u64..(64 * MIB), descriptor in any::<bool>()) {
        let ws = Arc::new(NullWinsys::new());
        let device = device(&ws);
        let free_before = ws.free_va_space();
        let usage = if descriptor {
            BufferUsageFlags::RESOURCE_DESCRIPTOR_BUFFER
        } else {
            BufferUsageFlags::STORAGE_BUFFER
        };

        let buffer = device
            .create_buffer(&BufferCreateInfo::new(size, usage).with_flags(BufferCreateFlags::SPARSE_BINDING))
            .unwrap();
        let va = device.buffer_device_address(&buffer);
        prop_assert_eq!(va % SPARSE_PAGE_SIZE, 0);
        prop_assert_eq!(
            free_before.as_bytes() - ws.free_va_space().as_bytes(),
            size.div_ceil(SPARSE_PAGE_SIZE) * SPARSE_PAGE_SIZE
        );
        if descriptor {
            prop_assert!(va < 1 << 32);
        }

        device.destroy_buffer(Some(buffer));
        prop_assert_eq!(ws.free_va_space(), free_before);
    }
}

#[test]
fn overallocation_is_tracked_per_heap() {
    let ws = Arc::new(NullWinsys::new());
    let info = DeviceCreateInfo::new().with_overallocation(OverallocationBehavior::Disallowed);
    let device = device_with(&ws, &DriverConfig::default(), &info);

    // The visible VRAM heap is 256 MiB.
    let first = device
        .allocate_memory(&MemoryAllocateInfo::new(200 * MIB, TYPE_VISIBLE_VRAM))
        .unwrap();
    let err = device
        .allocate_memory(&MemoryAllocateInfo::new(100 * MIB, TYPE_VISIBLE_VRAM))
        .unwrap_err();
    assert_eq!(err, VkError::OutOfDeviceMemory);

    // Other heaps are unaffected.
    let other = device
        .allocate_memory(&MemoryAllocateInfo::new(100 * MIB, TYPE_VRAM))
        .unwrap();

    device.free_memory(Some(first));
    let second = device
        .allocate_memory(&MemoryAllocateInfo::new(100 * MIB, TYPE_VISIBLE_VRAM))
        .unwrap();
    device.free_memory(Some(second));
    device.free_memory(Some(other));
}

#[test]
fn exported_memory_imports_without_size_checks() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);

    let private = device
        .allocate_memory(&MemoryAllocateInfo::new(4096, TYPE_VISIBLE_VRAM))
        .unwrap();
    assert!(device.get_memory_fd(&private).is_err());

    let exportable = MemoryAllocateInfo {
        exportable: true,
        ..MemoryAllocateInfo::new(4096, TYPE_VISIBLE_VRAM)
    };
    let memory = device.allocate_memory(&exportable).unwrap();
    let fd = device.get_memory_fd(&memory).unwrap();

    assert_eq!(
        device.memory_fd_properties(ExternalMemoryHandleType::DmaBuf, fd),
        Ok(1 << TYPE_VISIBLE_VRAM)
    );
    assert_eq!(
        device.memory_fd_properties(ExternalMemoryHandleType::OpaqueFd, fd),
        Err(VkError::InvalidExternalHandle)
    );

    let imported = device.import_memory_fd(fd, TYPE_VISIBLE_VRAM).unwrap();
    assert_eq!(imported.alloc_size(), 0);
    assert!(device.import_memory_fd(fd + 1000, TYPE_VISIBLE_VRAM).is_err());

    let mut buffer = device
        .create_buffer(&BufferCreateInfo::new(8192, BufferUsageFlags::STORAGE_BUFFER))
        .unwrap();
    device
        .bind_buffer_memory(&mut [BindBufferMemoryInfo::new(&mut buffer, &imported, 0)])
        .unwrap();
    assert_eq!(device.buffer_device_address(&buffer), imported.bo().va().raw());
}

#[test]
fn host_pointers_import_as_cached_gtt() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);
    assert_eq!(
        device.memory_host_pointer_properties(ExternalMemoryHandleType::HostAllocation),
        Ok(1 << 3)
    );
    assert_eq!(
        device.memory_host_pointer_properties(ExternalMemoryHandleType::DmaBuf),
        Err(VkError::InvalidExternalHandle)
    );
}

fn tiled_image(total_size: u64) -> Image {
    let layout = UnifiedLayout {
        swizzle_mode: 27,
        surf_pitch: 256,
        surf_slice_size: 256 * 256 * 4,
        ..UnifiedLayout::default()
    };
    let mut surface = Surface::unified(4, layout);
    surface.total_size = total_size;
    surface.alignment_log2 = 16;
    Image::new_2d(Format::R8G8B8A8Unorm, Extent3d::new_2d(256, 256), surface)
}

#[test]
fn image_requirements_follow_the_surface() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);

    let image = tiled_image(300_000);
    let reqs = device.image_memory_requirements(&image);
    assert_eq!(reqs.size, 300_000);
    assert_eq!(reqs.alignment, 64 * 1024);
    assert_eq!(reqs.memory_type_bits & TYPE_32BIT_MASK, 0);
    assert_ne!(reqs.memory_type_bits & (1 << TYPE_VRAM), 0);
    assert!(!reqs.requires_dedicated_allocation);

    let layout = image.subresource_layout(ImageAspects::COLOR, 0, 0).unwrap();
    assert!(layout.offset + layout.size <= reqs.size);
    assert_eq!(layout.row_pitch, 1024);
}

#[test]
fn shareable_tiled_images_need_dedicated_memory() {
    let ws = Arc::new(NullWinsys::new());
    let device = device(&ws);

    let mut image = tiled_image(1 << 20);
    image.shareable = true;
    let reqs = device.image_memory_requirements(&image);
    assert!(reqs.requires_dedicated_allocation);
    assert!(reqs.prefers_dedicated_allocation);

    image.surface.is_linear = true;
    assert!(!device.image_memory_requirements(&image).requires_dedicated_allocation);
}
