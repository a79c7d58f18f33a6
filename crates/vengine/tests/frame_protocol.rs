//! Frame protocol over the recording device: pacing, fence discipline,
//! swapchain recreation and the abort path

mod common;

use ash::vk;
use vengine::prelude::*;
use vengine::render::backends::gpu::{AcquireOutcome, PresentOutcome, QueueRole};
use vengine::render::backends::mock::{Call, ObjectKind, RecordingDevice};

use common::{empty_frame, renderer, TRIANGLE};

fn swapchains_created(device: &RecordingDevice) -> usize {
    device.count_calls(|call| matches!(call, Call::CreateSwapchain { .. }))
}

fn live_counts(device: &RecordingDevice) -> Vec<usize> {
    [
        ObjectKind::Swapchain,
        ObjectKind::ImageView,
        ObjectKind::Image,
        ObjectKind::Pipeline,
        ObjectKind::Fence,
        ObjectKind::Semaphore,
        ObjectKind::Buffer,
    ]
    .into_iter()
    .map(|kind| device.live(kind))
    .collect()
}

#[test]
fn test_ten_frames_with_two_in_flight() {
    let mut renderer = renderer("ten_frames");
    assert_eq!(renderer.frames_in_flight(), 2);
    assert_eq!(renderer.swapchain_extent(), vk::Extent2D { width: 800, height: 600 });

    for _ in 0..10 {
        empty_frame(&mut renderer);
    }

    let device = renderer.device();
    assert_eq!(device.presents(), 10);
    assert_eq!(renderer.frames_presented(), 10);
    assert_eq!(renderer.frame_index(), 0);
    let fenced_submits = device.count_calls(|call| {
        matches!(call, Call::Submit { role: QueueRole::Graphics, fence: Some(_), .. })
    });
    assert_eq!(fenced_submits, 10);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn test_ten_frames_draw_a_static_triangle() {
    let mut renderer = renderer("static_triangle");
    let (vertices, indices) = {
        let factory = renderer.resource_factory();
        (
            factory
                .create_vertex_buffer(&VertexBufferDesc::from_slice(&TRIANGLE, BufferUsage::Static))
                .unwrap(),
            factory
                .create_index_buffer(&IndexBufferDesc::from_u16(&[0, 1, 2], BufferUsage::Static))
                .unwrap(),
        )
    };
    assert_eq!(vertices.vertex_count(), 3);
    assert_eq!(indices.index_count(), 3);

    for _ in 0..10 {
        renderer.begin(ClearColor::new(0.2, 0.2, 0.2, 1.0)).unwrap();
        renderer.submit_geometry(&vertices, &indices).unwrap();
        renderer.end().unwrap();
        renderer.render().unwrap();
        renderer.present().unwrap();
    }

    let device = renderer.device();
    assert_eq!(device.presents(), 10);
    assert_eq!(renderer.frame_index(), 0);
    assert_eq!(device.count_calls(|call| matches!(call, Call::DrawIndexed(3))), 10);
    assert_eq!(
        device.count_calls(|call| matches!(call, Call::BindIndexBuffer(_, vk::IndexType::UINT16))),
        10
    );
    assert!(device.violations().is_empty(), "{:?}", device.violations());

    renderer.finish().unwrap();
    let factory = renderer.resource_factory();
    let expected: Vec<u8> = TRIANGLE.iter().flatten().flat_map(|f| f.to_le_bytes()).collect();
    assert_eq!(factory.read_back(&vertices).unwrap(), expected);
    let index_bytes: Vec<u8> = [0u16, 1, 2].iter().flat_map(|i| i.to_le_bytes()).collect();
    assert_eq!(factory.read_back(&indices).unwrap(), index_bytes);

    factory.delete_vertex_buffer(vertices);
    factory.delete_index_buffer(indices);
    assert_eq!(renderer.device().live(ObjectKind::Buffer), 0);
}

#[test]
fn test_fences_are_waited_before_reset() {
    let mut renderer = renderer("fence_discipline");
    for frame in 0..12 {
        if frame == 5 {
            renderer.frame_buffer_resize(640, 480);
        }
        empty_frame(&mut renderer);
    }

    let calls = renderer.device().calls();
    for (position, call) in calls.iter().enumerate() {
        if let Call::ResetFence(fence) = call {
            let waited = calls[..position]
                .iter()
                .rev()
                .take_while(|earlier| {
                    !matches!(earlier, Call::Submit { fence: Some(f), .. } if f == fence)
                })
                .any(|earlier| matches!(earlier, Call::WaitForFence(f) if f == fence));
            assert!(waited, "fence {fence:?} reset without a wait at call {position}");
        }
    }
    assert!(renderer.device().violations().is_empty());
}

#[test]
fn test_resize_recreates_without_leaking() {
    let mut renderer = renderer("resize");
    empty_frame(&mut renderer);
    empty_frame(&mut renderer);
    let before = live_counts(renderer.device());

    renderer.frame_buffer_resize(1024, 768);
    assert_eq!(renderer.swapchain_extent(), vk::Extent2D { width: 800, height: 600 });
    empty_frame(&mut renderer);

    assert_eq!(renderer.swapchain_extent(), vk::Extent2D { width: 1024, height: 768 });
    assert_eq!(swapchains_created(renderer.device()), 2);
    assert_eq!(live_counts(renderer.device()), before);

    for _ in 0..3 {
        renderer.frame_buffer_resize(1024, 768);
        empty_frame(&mut renderer);
    }
    assert_eq!(live_counts(renderer.device()), before);
    assert_eq!(renderer.device().presents(), 6);
}

#[test]
fn test_minimized_window_aborts_frames() {
    let mut renderer = renderer("minimized");
    empty_frame(&mut renderer);

    renderer.frame_buffer_resize(0, 0);
    for _ in 0..3 {
        empty_frame(&mut renderer);
        assert!(renderer.frame_aborted());
    }
    assert_eq!(renderer.device().presents(), 1);
    assert_eq!(renderer.frame_index(), 1);
    assert_eq!(swapchains_created(renderer.device()), 1);

    renderer.frame_buffer_resize(800, 600);
    empty_frame(&mut renderer);
    assert!(!renderer.frame_aborted());
    assert_eq!(renderer.device().presents(), 2);
    assert_eq!(swapchains_created(renderer.device()), 2);
}

#[test]
fn test_zero_surface_extent_aborts_like_minimized() {
    let mut renderer = renderer("zero_surface");
    empty_frame(&mut renderer);

    renderer.device().set_current_extent(0, 0);
    renderer.device().script_acquire(AcquireOutcome::OutOfDate);
    for _ in 0..3 {
        empty_frame(&mut renderer);
        assert!(renderer.frame_aborted());
    }
    assert_eq!(renderer.device().presents(), 1);
    assert_eq!(swapchains_created(renderer.device()), 1);

    renderer.device().set_current_extent(1024, 768);
    empty_frame(&mut renderer);
    assert!(!renderer.frame_aborted());
    assert_eq!(renderer.swapchain_extent(), vk::Extent2D { width: 1024, height: 768 });
    assert_eq!(renderer.device().presents(), 2);
    assert_eq!(swapchains_created(renderer.device()), 2);
    assert!(renderer.device().violations().is_empty());
}

#[test]
fn test_out_of_date_acquire_aborts_without_advancing() {
    let mut renderer = renderer("out_of_date");
    renderer.device().script_acquire(AcquireOutcome::OutOfDate);

    empty_frame(&mut renderer);
    assert!(renderer.frame_aborted());
    assert_eq!(renderer.frame_index(), 0);
    assert_eq!(renderer.frames_presented(), 0);
    assert_eq!(renderer.device().presents(), 0);
    assert_eq!(renderer.device().count_calls(|call| matches!(call, Call::ResetFence(_))), 0);
    assert_eq!(swapchains_created(renderer.device()), 2);

    empty_frame(&mut renderer);
    assert_eq!(renderer.frame_index(), 1);
    assert_eq!(renderer.device().presents(), 1);
    assert!(renderer.device().violations().is_empty());
}

#[test]
fn test_suboptimal_acquire_presents_then_recreates() {
    let mut renderer = renderer("suboptimal_acquire");
    renderer.device().script_acquire(AcquireOutcome::Acquired {
        image_index: 0,
        suboptimal: true,
    });

    empty_frame(&mut renderer);
    assert!(!renderer.frame_aborted());
    assert_eq!(renderer.device().presents(), 1);
    assert_eq!(swapchains_created(renderer.device()), 2);

    empty_frame(&mut renderer);
    assert_eq!(swapchains_created(renderer.device()), 2);
}

#[test]
fn test_out_of_date_present_still_advances() {
    let mut renderer = renderer("present_out_of_date");
    renderer.device().script_present(PresentOutcome::OutOfDate);

    empty_frame(&mut renderer);
    assert_eq!(renderer.frame_index(), 1);
    assert_eq!(renderer.device().presents(), 0);
    assert_eq!(swapchains_created(renderer.device()), 2);

    empty_frame(&mut renderer);
    assert_eq!(renderer.device().presents(), 1);
    assert!(renderer.device().violations().is_empty());
}

#[test]
fn test_frame_records_barriers_and_clear() {
    let mut renderer = renderer("barriers");
    renderer.device().clear_calls();
    empty_frame(&mut renderer);

    let device = renderer.device();
    let clear: [f32; 4] = [0.2, 0.2, 0.2, 1.0];
    let transitions_to = |layout: vk::ImageLayout| {
        device.count_calls(|call| matches!(call, Call::ImageBarrier(b) if b.new_layout == layout))
    };
    let extent = vk::Extent2D { width: 800, height: 600 };

    assert_eq!(
        device.count_calls(|call| {
            matches!(call, Call::BeginRendering(target) if target.clear_color == clear)
        }),
        1
    );
    assert_eq!(transitions_to(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL), 1);
    assert_eq!(transitions_to(vk::ImageLayout::PRESENT_SRC_KHR), 1);
    assert_eq!(
        device.count_calls(|call| matches!(call, Call::SetViewportScissor(e) if *e == extent)),
        1
    );
}

#[test]
fn test_terminate_tears_down_in_reverse_order() {
    let mut renderer = renderer("terminate_order");
    empty_frame(&mut renderer);
    renderer.device().clear_calls();

    renderer.terminate().unwrap();
    let calls = renderer.device().calls();
    let position = |wanted: fn(&Call) -> bool| calls.iter().position(|call| wanted(call)).unwrap();

    let idle = position(|call| matches!(call, Call::WaitIdle));
    let pipeline = position(|call| matches!(call, Call::DestroyPipeline(_)));
    let depth = position(|call| matches!(call, Call::DestroyImage(_)));
    let swapchain = position(|call| matches!(call, Call::DestroySwapchain(_)));
    let allocator = position(|call| matches!(call, Call::ReleaseAllocator));
    let shutdown = position(|call| matches!(call, Call::Shutdown));

    assert_eq!(idle, 0);
    assert!(pipeline < depth);
    assert!(depth < swapchain);
    assert!(swapchain < allocator);
    assert!(allocator < shutdown);
    assert!(renderer.is_terminated());
    assert!(renderer.device().violations().is_empty());
}

#[test]
fn test_missing_shader_fails_initialization() {
    let config = common::config("missing_shader").with_shaders(ShaderConfig::new(
        "/nonexistent/triangle.vert.spv",
        "/nonexistent/triangle.frag.spv",
    ));
    let result = VulkanRenderer::with_device(RecordingDevice::new(), config);
    assert!(matches!(result, Err(RenderError::Config(_))));
}
