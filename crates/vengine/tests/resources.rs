//! Buffer creation, upload and release through the renderer's factory

mod common;

use vengine::prelude::*;
use vengine::render::backends::gpu::{MemoryLocation, QueueRole};
use vengine::render::backends::mock::{Call, ObjectKind, RecordingDevice};
use vengine::render::backends::vulkan::GpuBuffer;

use common::{renderer, TRIANGLE};

#[test]
fn test_static_vertex_buffer_round_trip() {
    let renderer = renderer("static_round_trip");
    let factory = renderer.resource_factory();

    let vertices = factory
        .create_vertex_buffer(&VertexBufferDesc::from_slice(&TRIANGLE, BufferUsage::Static))
        .unwrap();
    assert_eq!(vertices.vertex_count(), 3);
    assert_eq!(AsRef::<GpuBuffer>::as_ref(&vertices).location(), MemoryLocation::GpuOnly);

    let expected: Vec<u8> = TRIANGLE.iter().flatten().flat_map(|f| f.to_le_bytes()).collect();
    assert_eq!(factory.read_back(&vertices).unwrap(), expected);

    let device = renderer.device();
    assert_eq!(
        device.count_calls(|call| matches!(call, Call::Submit { role: QueueRole::Transfer, .. })),
        2
    );
    assert_eq!(device.live(ObjectKind::Buffer), 1);

    factory.delete_vertex_buffer(vertices);
    assert_eq!(device.live(ObjectKind::Buffer), 0);
}

#[test]
fn test_dynamic_buffer_takes_overwrites() {
    let renderer = renderer("dynamic_overwrite");
    let factory = renderer.resource_factory();

    let vertices = factory
        .create_vertex_buffer(&VertexBufferDesc::from_slice(&TRIANGLE, BufferUsage::Dynamic))
        .unwrap();
    assert!(AsRef::<GpuBuffer>::as_ref(&vertices).location().is_mapped());

    let replacement = [7u8; 72];
    factory.upload_data(&vertices, &replacement).unwrap();
    assert_eq!(factory.read_back(&vertices).unwrap(), replacement.to_vec());

    assert!(factory.upload_data(&vertices, &[0u8; 73]).is_err());
    factory.delete_vertex_buffer(vertices);
}

#[test]
fn test_static_buffers_reject_uploads_and_empty_data() {
    let renderer = renderer("static_rejects");
    let factory = renderer.resource_factory();

    let indices = factory
        .create_index_buffer(&IndexBufferDesc::from_u16(&[0, 1, 2], BufferUsage::Static))
        .unwrap();
    assert!(factory.upload_data(&indices, &[0u8; 6]).is_err());
    assert!(factory
        .create_vertex_buffer(&VertexBufferDesc::empty(64, 4, BufferUsage::Static))
        .is_err());

    factory.delete_index_buffer(indices);
}

#[test]
fn test_unsupported_index_widths_are_rejected() {
    let renderer = renderer("index_widths");
    let factory = renderer.resource_factory();
    let bytes = [0u8; 12];

    for index_width in [IndexWidth::U8, IndexWidth::U64] {
        let desc = IndexBufferDesc {
            data: &bytes,
            size_in_bytes: 12,
            element_count: 3,
            usage: BufferUsage::Dynamic,
            index_width,
        };
        assert!(factory.create_index_buffer(&desc).is_err());
    }
    assert_eq!(renderer.device().live(ObjectKind::Buffer), 0);
}

#[test]
fn test_geometry_draws_every_index() {
    let mut renderer = renderer("draw_geometry");
    let (vertices, indices) = {
        let factory = renderer.resource_factory();
        (
            factory
                .create_vertex_buffer(&VertexBufferDesc::from_slice(&TRIANGLE, BufferUsage::Static))
                .unwrap(),
            factory
                .create_index_buffer(&IndexBufferDesc::from_u32(
                    &[0, 1, 2, 2, 1, 0],
                    BufferUsage::Static,
                ))
                .unwrap(),
        )
    };

    for _ in 0..4 {
        renderer.begin(ClearColor::new(0.2, 0.2, 0.2, 1.0)).unwrap();
        renderer.submit_geometry(&vertices, &indices).unwrap();
        renderer.submit_geometry(&vertices, &indices).unwrap();
        renderer.end().unwrap();
        renderer.render().unwrap();
        renderer.present().unwrap();
    }

    let device = renderer.device();
    assert_eq!(device.count_calls(|call| matches!(call, Call::DrawIndexed(6))), 8);
    assert!(device.violations().is_empty());

    renderer.finish().unwrap();
    let factory = renderer.resource_factory();
    factory.delete_vertex_buffer(vertices);
    factory.delete_index_buffer(indices);
    assert_eq!(renderer.device().live(ObjectKind::Buffer), 0);
}

#[test]
fn test_uniform_block_follows_the_frame_slot() {
    let config = common::config("uniform_slots").with_uniform_buffer(64);
    let mut renderer = VulkanRenderer::with_device(RecordingDevice::new(), config).unwrap();
    assert_eq!(renderer.device().live(ObjectKind::Buffer), 2);

    for frame in 0..4u8 {
        renderer.begin(ClearColor::default()).unwrap();
        renderer.update_uniform_data(&[frame; 64]).unwrap();
        renderer.end().unwrap();
        renderer.render().unwrap();
        renderer.present().unwrap();
    }
    assert!(renderer.device().violations().is_empty());
}

#[test]
fn test_buffers_alive_at_terminate_are_reclaimed() {
    let mut renderer = renderer("leak_on_terminate");
    let vertices = renderer
        .resource_factory()
        .create_vertex_buffer(&VertexBufferDesc::from_slice(&TRIANGLE, BufferUsage::Dynamic))
        .unwrap();

    renderer.terminate().unwrap();
    assert_eq!(renderer.device().leaked_buffers(), 1);
    assert_eq!(renderer.device().live(ObjectKind::Buffer), 0);
    drop(vertices);
}

#[test]
fn test_updating_uniforms_without_a_block_fails() {
    let mut renderer = renderer("no_uniforms");
    renderer.begin(ClearColor::default()).unwrap();
    assert!(renderer.update_uniform_data(&[0; 16]).is_err());
}
