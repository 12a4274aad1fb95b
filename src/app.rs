// Scene renderer
//
// The frame participant that owns the scene: per-frame uniform and light
// buffers, the scene and sky pipelines, the cameras and the overlay. Each
// frame it updates the cameras, builds the uniform and light data, records
// the draw commands and hands everything to the FrameProtocol.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec3;
use std::path::Path;

use crate::config::Config;
use crate::diagnostics::FrameRateHistory;
use crate::frame::{
    BufferDesc, BufferHandle, BufferUsage, DescriptorBinding, DescriptorKind, DescriptorSlot, DrawCommand,
    FrameProtocol, FrameWork, GeometryHandles, GpuBackend, LightWait, MemoryUsage, PerFrame, PipelineDesc,
    PipelineHandle, VertexStream,
};
use crate::input::Key;
use crate::overlay::{self, OverlayCallback, OverlayFrame, PanelBindings, RenderSettings};
use crate::participant::{FrameContext, FrameParticipant};
use crate::scene::geometry;
use crate::scene::lights::animate_lights;
use crate::scene::loader::upload_mesh;
use crate::scene::{
    Camera, CameraKind, CameraRig, DrawCall, FrameUniforms, LightSource, LightSourceBlock, PushConstants,
    SceneDescription,
};
use crate::updater::{self, UpdateEvent};

const SKY_RADIUS: f32 = 500.0;

/// Everything the renderer takes from the configuration.
#[derive(Clone, Debug)]
pub struct RendererOptions {
    pub light_wait: LightWait,
    pub clear_color: [f32; 4],
    pub shader_dir: std::path::PathBuf,
    pub normal_mapping_strength: f32,
    pub camera_position: Vec3,
    pub camera_direction: Vec3,
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
    pub quit_key: Key,
}

impl RendererOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            light_wait: config.graphics.light_wait,
            clear_color: config.graphics.clear_color,
            shader_dir: config.scene.shader_dir.clone(),
            normal_mapping_strength: config.scene.normal_mapping_strength,
            camera_position: Vec3::from(config.scene.camera_position),
            camera_direction: Vec3::from(config.scene.camera_direction),
            fov_degrees: config.scene.fov_degrees,
            near: config.scene.near,
            far: config.scene.far,
            quit_key: Key::from_name(&config.controls.quit_key)?,
        })
    }
}

/// Scene pipeline: Blinn-Phong with normal mapping.
///
/// set 0: (0) materials   set 1: (0) uniforms, (1) lights
pub fn scene_pipeline_desc(shader_dir: &Path) -> PipelineDesc {
    let vertex_and_fragment = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    PipelineDesc {
        name: "scene".to_string(),
        vertex_shader: shader_dir.join("transform_and_pass_on.vert.spv"),
        fragment_shader: shader_dir.join("blinnphong_and_normal_mapping.frag.spv"),
        vertex_streams: vec![
            VertexStream::vec3(0, 0),
            VertexStream::vec2(1, 1),
            VertexStream::vec3(2, 2),
            VertexStream::vec3(3, 3),
            VertexStream::vec3(4, 4),
        ],
        descriptors: vec![
            DescriptorSlot {
                set: 0,
                binding: 0,
                kind: DescriptorKind::StorageBuffer,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
            DescriptorSlot { set: 1, binding: 0, kind: DescriptorKind::UniformBuffer, stages: vertex_and_fragment },
            DescriptorSlot {
                set: 1,
                binding: 1,
                kind: DescriptorKind::StorageBuffer,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        ],
        push_constant_size: std::mem::size_of::<PushConstants>() as u32,
        push_constant_stages: vertex_and_fragment,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        depth_test: true,
        depth_write: true,
    }
}

/// Sky pipeline: gradient on a sphere around the camera, behind everything.
pub fn sky_pipeline_desc(shader_dir: &Path) -> PipelineDesc {
    PipelineDesc {
        name: "sky".to_string(),
        vertex_shader: shader_dir.join("sky_gradient.vert.spv"),
        fragment_shader: shader_dir.join("sky_gradient.frag.spv"),
        vertex_streams: vec![VertexStream::vec3(0, 0)],
        descriptors: vec![DescriptorSlot {
            set: 0,
            binding: 0,
            kind: DescriptorKind::UniformBuffer,
            stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        }],
        push_constant_size: 0,
        push_constant_stages: vk::ShaderStageFlags::empty(),
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        depth_test: false,
        depth_write: false,
    }
}

/// GPU objects created in `initialize`.
struct GpuResources {
    materials: BufferHandle,
    uniforms: PerFrame<BufferHandle>,
    lights: PerFrame<BufferHandle>,
    scene_pipeline: PipelineHandle,
    sky_pipeline: PipelineHandle,
    sky_geometry: GeometryHandles,
    draw_calls: Vec<DrawCall>,
}

pub struct SceneRenderer {
    scene: SceneDescription,
    options: RendererOptions,
    protocol: FrameProtocol,
    settings: RenderSettings,
    cameras: CameraRig,
    lights: Vec<LightSource>,
    frame_rates: FrameRateHistory,
    overlay: OverlayCallback,
    pipeline_descs: Vec<(PipelineHandle, PipelineDesc)>,
    gpu: Option<GpuResources>,
}

impl SceneRenderer {
    pub fn new(scene: SceneDescription, options: RendererOptions, overlay: OverlayCallback) -> Self {
        let mut camera = Camera::perspective(options.fov_degrees, 16.0 / 9.0, options.near, options.far);
        camera.set_translation(options.camera_position);
        camera.look_along(options.camera_direction);

        let mut settings = RenderSettings::default();
        settings.set_normal_mapping_strength(options.normal_mapping_strength);

        Self {
            scene,
            protocol: FrameProtocol::new(options.light_wait),
            options,
            settings,
            cameras: CameraRig::new(camera),
            lights: Vec::new(),
            frame_rates: FrameRateHistory::default(),
            overlay,
            pipeline_descs: Vec::new(),
            gpu: None,
        }
    }

    /// Renderer with the keyboard settings panel as its overlay.
    pub fn with_settings_panel(scene: SceneDescription, config: &Config) -> Result<Self> {
        let options = RendererOptions::from_config(config)?;
        let bindings = PanelBindings::from_config(&config.controls)?;
        Ok(Self::new(scene, options, overlay::settings_panel(bindings, config.debug.show_fps)))
    }

    pub fn cameras(&self) -> &CameraRig {
        &self.cameras
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn light_wait(&self) -> LightWait {
        self.protocol.light_wait()
    }

    fn gpu(&self) -> Result<&GpuResources> {
        self.gpu.as_ref().context("Scene renderer used before initialize")
    }

    /// Uniform and light data for the active camera at time `t`.
    ///
    /// Pure: the same camera, settings and `t` give byte-identical data.
    pub fn frame_data(&self, t: f32) -> Result<(FrameUniforms, LightSourceBlock)> {
        let camera = self.cameras.active();
        let view = camera.view_matrix();
        let uniforms = FrameUniforms::new(
            view,
            camera.projection_matrix(),
            camera.translation(),
            self.settings.normal_mapping_strength,
        );
        let lights = LightSourceBlock::build(&animate_lights(&self.lights, t), view)?;
        Ok((uniforms, lights))
    }

    /// Commands for one frame, referencing the frame slot's buffers.
    fn build_commands(&self, uniforms: BufferHandle, lights: BufferHandle) -> Result<Vec<DrawCommand>> {
        let gpu = self.gpu()?;
        let mut commands = vec![DrawCommand::BeginRenderPass {
            pipeline: gpu.scene_pipeline,
            clear_color: self.options.clear_color,
        }];

        if self.settings.draw_sky {
            commands.push(DrawCommand::BindPipeline(gpu.sky_pipeline));
            commands.push(DrawCommand::BindDescriptors {
                pipeline: gpu.sky_pipeline,
                bindings: vec![DescriptorBinding::new(0, 0, uniforms)],
            });
            commands.push(DrawCommand::DrawIndexed { geometry: gpu.sky_geometry, vertex_streams: 1 });
        }

        commands.push(DrawCommand::BindPipeline(gpu.scene_pipeline));
        commands.push(DrawCommand::BindDescriptors {
            pipeline: gpu.scene_pipeline,
            bindings: vec![
                DescriptorBinding::new(0, 0, gpu.materials),
                DescriptorBinding::new(1, 0, uniforms),
                DescriptorBinding::new(1, 1, lights),
            ],
        });
        for draw in &gpu.draw_calls {
            let push = PushConstants::new(draw.model, draw.material_index);
            commands.push(DrawCommand::PushConstants {
                pipeline: gpu.scene_pipeline,
                data: bytemuck::bytes_of(&push).to_vec(),
            });
            commands.push(DrawCommand::DrawIndexed { geometry: draw.geometry, vertex_streams: 5 });
        }
        commands.push(DrawCommand::EndRenderPass);
        Ok(commands)
    }

    fn rebuild_pipelines(&self, backend: &mut dyn GpuBackend, filter: impl Fn(&PipelineDesc) -> bool) -> Result<()> {
        for (handle, desc) in &self.pipeline_descs {
            if filter(desc) {
                backend
                    .rebuild_pipeline(*handle)
                    .with_context(|| format!("Rebuilding pipeline '{}'", desc.name))?;
                log::info!("Rebuilt pipeline '{}'", desc.name);
            }
        }
        Ok(())
    }
}

impl FrameParticipant for SceneRenderer {
    fn initialize(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        let backend = &mut *ctx.backend;
        let frames = backend.concurrent_frames();

        let loaded = self.scene.upload(backend).context("Uploading scene")?;
        self.lights = loaded.lights;

        // One uniform and one light buffer per frame slot
        let uniforms = PerFrame::try_new(frames, |slot| {
            backend.create_buffer(&BufferDesc::new(
                format!("uniforms[{}]", slot),
                std::mem::size_of::<FrameUniforms>() as u64,
                BufferUsage::Uniform,
                MemoryUsage::HostVisible,
            ))
        })?;
        let lights = PerFrame::try_new(frames, |slot| {
            backend.create_buffer(&BufferDesc::new(
                format!("lights[{}]", slot),
                std::mem::size_of::<LightSourceBlock>() as u64,
                BufferUsage::Storage,
                MemoryUsage::Device,
            ))
        })?;

        let sky_mesh = geometry::uv_sphere(SKY_RADIUS, 32, 16);
        let sky_geometry = upload_mesh(backend, &sky_mesh, "sky").context("Uploading sky sphere")?;

        let scene_desc = scene_pipeline_desc(&self.options.shader_dir);
        let sky_desc = sky_pipeline_desc(&self.options.shader_dir);
        let scene_pipeline = backend.create_graphics_pipeline(&scene_desc).context("Creating scene pipeline")?;
        let sky_pipeline = backend.create_graphics_pipeline(&sky_desc).context("Creating sky pipeline")?;
        self.pipeline_descs = vec![(scene_pipeline, scene_desc), (sky_pipeline, sky_desc)];

        self.cameras.set_aspect_ratio(backend.aspect_ratio());

        log::info!(
            "Scene renderer ready: {} draw calls, {} lights, {} frames in flight, light wait {:?}",
            loaded.draw_calls.len(),
            self.lights.len(),
            frames,
            self.protocol.light_wait()
        );
        self.gpu = Some(GpuResources {
            materials: loaded.materials,
            uniforms,
            lights,
            scene_pipeline,
            sky_pipeline,
            sky_geometry,
            draw_calls: loaded.draw_calls,
        });
        Ok(())
    }

    fn update(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        if ctx.time.delta > 0.0 {
            self.frame_rates.record_frame_time(ctx.time.delta);
        }

        // Quit only exits the application from the orbit camera; the overlay
        // uses it to leave the quake camera.
        let quit = ctx.input.pressed(self.options.quit_key) && self.cameras.is_enabled(CameraKind::Orbit);
        if quit || ctx.input.close_requested() {
            ctx.request_stop();
            return Ok(());
        }

        let mut frame = OverlayFrame::new(&mut self.settings, &mut self.cameras, ctx.input, &self.frame_rates);
        (self.overlay)(&mut frame);
        if let Some(status) = frame.take_status() {
            ctx.backend.set_status_text(&status);
        }

        self.cameras.update(ctx.input, ctx.time.delta);
        Ok(())
    }

    fn render(&mut self, ctx: &mut FrameContext<'_>) -> Result<()> {
        let frame = ctx.backend.frame_index();
        let (uniforms, lights) = self.frame_data(ctx.time.elapsed)?;

        let gpu = self.gpu()?;
        let uniform_buffer = *gpu.uniforms.for_frame(frame);
        let light_buffer = *gpu.lights.for_frame(frame);
        let commands = self.build_commands(uniform_buffer, light_buffer)?;

        let work = FrameWork {
            uniform_buffer,
            uniform_bytes: uniforms.as_bytes(),
            light_buffer,
            light_bytes: lights.as_bytes(),
            commands: &commands,
        };
        self.protocol.run(&mut *ctx.backend, &work)
    }

    fn handle_event(&mut self, event: &UpdateEvent, ctx: &mut FrameContext<'_>) -> Result<()> {
        match event {
            UpdateEvent::SwapchainChanged { aspect_ratio } => {
                self.cameras.set_aspect_ratio(*aspect_ratio);
                self.rebuild_pipelines(&mut *ctx.backend, |_| true)
            }
            UpdateEvent::ShadersChanged(binaries) => self.rebuild_pipelines(&mut *ctx.backend, |desc| {
                desc.shader_paths()
                    .iter()
                    .any(|shader| binaries.iter().any(|changed| updater::affects(shader, changed)))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::headless::GpuOp;
    use crate::frame::{Hazard, HeadlessBackend};
    use crate::input::InputState;
    use crate::participant::{Composition, FrameTime};
    use std::path::PathBuf;

    fn renderer(light_wait: LightWait) -> SceneRenderer {
        let options = RendererOptions { light_wait, ..RendererOptions::from_config(&Config::default()).unwrap() };
        let panel = overlay::settings_panel(PanelBindings::default(), true);
        SceneRenderer::new(SceneDescription::default(), options, panel)
    }

    fn composition(frames_in_flight: usize, light_wait: LightWait) -> Composition<HeadlessBackend> {
        let mut composition =
            Composition::new(HeadlessBackend::new(frames_in_flight, 1920, 1080)).with_fixed_timestep(1.0 / 60.0);
        composition.add(renderer(light_wait));
        composition
    }

    /// Drives a renderer by hand so its state stays inspectable.
    struct Manual {
        backend: HeadlessBackend,
        input: InputState,
        renderer: SceneRenderer,
        stop: bool,
        time: FrameTime,
    }

    impl Manual {
        fn new() -> Self {
            let mut manual = Self {
                backend: HeadlessBackend::new(3, 1920, 1080),
                input: InputState::new(),
                renderer: renderer(LightWait::FragmentShader),
                stop: false,
                time: FrameTime::default(),
            };
            let mut ctx = FrameContext::new(&mut manual.backend, &mut manual.input, manual.time, &mut manual.stop);
            manual.renderer.initialize(&mut ctx).unwrap();
            manual
        }

        fn update(&mut self) {
            self.time.delta = 1.0 / 60.0;
            self.time.elapsed += self.time.delta;
            let mut ctx = FrameContext::new(&mut self.backend, &mut self.input, self.time, &mut self.stop);
            self.renderer.update(&mut ctx).unwrap();
            self.input.end_frame();
        }

        fn event(&mut self, event: UpdateEvent) {
            let mut ctx = FrameContext::new(&mut self.backend, &mut self.input, self.time, &mut self.stop);
            self.renderer.handle_event(&event, &mut ctx).unwrap();
        }
    }

    #[test]
    fn correct_protocol_has_no_hazards() {
        let mut composition = composition(3, LightWait::FragmentShader);
        assert_eq!(composition.run_frames(12).unwrap(), 12);
        assert_eq!(composition.backend().hazards(), &[] as &[Hazard]);
    }

    #[test]
    fn submission_waits_on_image_and_lights() {
        let mut composition = composition(3, LightWait::FragmentShader);
        composition.run_frames(1).unwrap();

        let submit = composition
            .backend()
            .timeline()
            .iter()
            .find_map(|op| match op {
                GpuOp::Submit { waits, .. } => Some(waits.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            submit,
            vec![
                ("image-available", vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS),
                ("transfer-complete", vk::PipelineStageFlags::FRAGMENT_SHADER),
            ]
        );
    }

    #[test]
    fn present_only_light_wait_reads_stale_lights() {
        let mut composition = composition(3, LightWait::PresentOnly);
        composition.run_frames(3).unwrap();

        let stale: Vec<&Hazard> = composition
            .backend()
            .hazards()
            .iter()
            .filter(|h| matches!(h, Hazard::StaleRead { stage, .. } if *stage == vk::PipelineStageFlags::FRAGMENT_SHADER))
            .collect();
        assert_eq!(stale.len(), 3);
        // Presentation still waits on both, so nothing else is flagged
        assert_eq!(composition.backend().hazards().len(), 3);
    }

    #[test]
    fn frame_slots_are_reused_every_n_frames() {
        for frames_in_flight in [1, 2, 3] {
            let mut composition = composition(frames_in_flight, LightWait::FragmentShader);
            composition.run_frames(4 * frames_in_flight as u64).unwrap();

            let writes: Vec<_> = composition
                .backend()
                .timeline()
                .iter()
                .filter_map(|op| match op {
                    GpuOp::HostWrite { frame, buffer } => Some((*frame, *buffer)),
                    _ => None,
                })
                .collect();
            for (frame, buffer) in &writes {
                let same_slot = writes.iter().find(|(f, _)| *f == frame + frames_in_flight as u64);
                if let Some((_, reused)) = same_slot {
                    assert_eq!(reused, buffer);
                }
                for other in 1..frames_in_flight as u64 {
                    if let Some((_, different)) = writes.iter().find(|(f, _)| *f == frame + other) {
                        assert_ne!(different, buffer);
                    }
                }
            }
            assert!(composition.backend().hazards().is_empty());
        }
    }

    #[test]
    fn command_buffers_are_released_after_n_frames() {
        let mut composition = composition(3, LightWait::FragmentShader);
        composition.run_frames(10).unwrap();
        // Frames 7, 8 and 9 may still be executing
        assert_eq!(composition.backend().live_command_buffers(), 3);

        composition.shutdown().unwrap();
        assert_eq!(composition.backend().live_command_buffers(), 0);
    }

    #[test]
    fn resize_rebuilds_pipelines_and_fixes_aspect() {
        let mut composition = composition(2, LightWait::FragmentShader);
        composition.run_frames(1).unwrap();
        composition.backend_mut().surface_resized(800, 800);
        composition.run_frames(2).unwrap();

        let backend = composition.backend();
        assert_eq!(backend.pipeline_count(), 2);
        for name in ["scene", "sky"] {
            let pipeline = backend.pipeline_named(name).unwrap();
            assert_eq!(backend.pipeline_rebuilds(pipeline), Some(1));
        }

        let mut manual = Manual::new();
        manual.event(UpdateEvent::SwapchainChanged { aspect_ratio: 1.25 });
        assert_eq!(manual.renderer.cameras().active().aspect_ratio(), 1.25);
    }

    #[test]
    fn shader_change_rebuilds_only_affected_pipeline() {
        let mut manual = Manual::new();
        manual.event(UpdateEvent::ShadersChanged(vec![PathBuf::from("shaders/sky_gradient.frag.spv")]));

        let gpu = manual.renderer.gpu().unwrap();
        assert_eq!(manual.backend.pipeline_rebuilds(gpu.sky_pipeline), Some(1));
        assert_eq!(manual.backend.pipeline_rebuilds(gpu.scene_pipeline), Some(0));
    }

    #[test]
    fn frame_data_is_idempotent() {
        let manual = Manual::new();
        let (u1, l1) = manual.renderer.frame_data(2.5).unwrap();
        let (u2, l2) = manual.renderer.frame_data(2.5).unwrap();
        assert_eq!(u1.as_bytes(), u2.as_bytes());
        assert_eq!(l1.as_bytes(), l2.as_bytes());
        assert_eq!(u1.user_input.x, 0.5);
        assert_eq!(l1.validate(), Ok(()));
    }

    #[test]
    fn quit_key_stops_only_from_orbit_camera() {
        let mut manual = Manual::new();
        manual.input.key_down(Key::F(1));
        manual.update();
        manual.input.key_up(Key::F(1));
        assert!(manual.renderer.cameras().is_enabled(CameraKind::Quake));

        manual.input.key_down(Key::Escape);
        manual.update();
        manual.input.key_up(Key::Escape);
        assert!(!manual.stop);
        assert!(manual.renderer.cameras().is_enabled(CameraKind::Orbit));

        manual.input.key_down(Key::Escape);
        manual.update();
        assert!(manual.stop);
    }

    #[test]
    fn holding_control_freezes_the_cameras() {
        let mut manual = Manual::new();
        manual.input.key_down(Key::F(1));
        manual.update();
        manual.input.key_up(Key::F(1));
        let start = manual.renderer.cameras().active().translation();

        manual.input.key_down(Key::Control);
        manual.input.key_down(Key::W);
        manual.update();
        assert_eq!(manual.renderer.cameras().active().translation(), start);

        manual.input.key_up(Key::Control);
        manual.update();
        assert_ne!(manual.renderer.cameras().active().translation(), start);
    }

    #[test]
    fn close_request_stops() {
        let mut composition = composition(3, LightWait::FragmentShader);
        composition.run_frames(2).unwrap();
        composition.input_mut().request_close();
        assert_eq!(composition.run_frames(5).unwrap(), 0);
        assert!(composition.is_stopped());
    }

    #[test]
    fn status_line_is_published() {
        let mut composition = composition(3, LightWait::FragmentShader);
        composition.run_frames(1).unwrap();
        assert!(composition.backend().status_text().contains("Orbit camera"));
    }

    #[test]
    fn uploaded_uniforms_match_camera() {
        let mut composition = composition(3, LightWait::FragmentShader);
        composition.run_frames(1).unwrap();

        let backend = composition.backend();
        let uniform_buffer = backend
            .timeline()
            .iter()
            .find_map(|op| match op {
                GpuOp::HostWrite { buffer, .. } => Some(*buffer),
                _ => None,
            })
            .unwrap();
        let bytes = backend.buffer_contents(uniform_buffer).unwrap();
        let uniforms: FrameUniforms = bytemuck::pod_read_unaligned(bytes);
        let position = uniforms.camera_position.w_axis.truncate();
        assert!((position - Vec3::new(-6.81, 1.71, -0.72)).length() < 1e-4);
    }
}
