// Updater
//
// Collects events that require pipelines or cameras to be rebuilt between
// frames:
// - the swapchain was recreated (new extent / aspect ratio)
// - shader sources changed on disk (hot reload: recompile with glslc, then
//   rebuild the pipelines using them)

use anyhow::{bail, Context, Result};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{channel, Receiver};

#[derive(Clone, Debug, PartialEq)]
pub enum UpdateEvent {
    SwapchainChanged { aspect_ratio: f32 },
    /// Compiled shader binaries that changed.
    ShadersChanged(Vec<PathBuf>),
}

/// True if `changed` is the shader binary `shader` or its GLSL source.
pub fn affects(shader: &Path, changed: &Path) -> bool {
    let (Some(shader_name), Some(changed_name)) = (shader.file_name(), changed.file_name()) else {
        return false;
    };
    let changed_name = changed_name.to_string_lossy();
    let binary = if changed_name.ends_with(".spv") { changed_name.to_string() } else { format!("{}.spv", changed_name) };
    shader_name.to_string_lossy() == binary
}

/// Compile one GLSL stage to SPIR-V next to the source.
pub fn compile_shader(source: &Path) -> Result<PathBuf> {
    let mut output = source.as_os_str().to_owned();
    output.push(".spv");
    let output = PathBuf::from(output);

    let status = Command::new("glslc")
        .arg("--target-env=vulkan1.2")
        .arg(source)
        .arg("-o")
        .arg(&output)
        .status()
        .context("Failed to run glslc (is the Vulkan SDK installed?)")?;
    if !status.success() {
        bail!("glslc failed on {:?}: exit code {:?}", source, status.code());
    }
    log::info!("Compiled {:?} -> {:?}", source, output);
    Ok(output)
}

fn is_stage_source(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("vert" | "frag"))
}

fn is_include(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("glsl")
}

/// GLSL stages to recompile for a batch of changed files. Binaries are
/// ignored: our own compiles write them into the watched directory.
fn sources_to_compile(
    changed: impl IntoIterator<Item = PathBuf>,
    all_stages: impl FnOnce() -> Vec<PathBuf>,
) -> BTreeSet<PathBuf> {
    let mut sources = BTreeSet::new();
    let mut include_changed = false;
    for path in changed {
        if is_stage_source(&path) {
            sources.insert(path);
        } else if is_include(&path) {
            include_changed = true;
        }
    }
    if include_changed {
        sources.extend(all_stages());
    }
    sources
}

/// Watches the shader directory.
pub struct ShaderWatcher {
    dir: PathBuf,
    rx: Receiver<PathBuf>,
    _watcher: RecommendedWatcher,
}

impl ShaderWatcher {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (tx, rx) = channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
            },
            Config::default(),
        )
        .context("Failed to create shader watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;

        log::info!("Watching {:?} for shader changes", dir);
        Ok(Self { dir, rx, _watcher: watcher })
    }

    /// Drain pending file events: GLSL sources are recompiled, and the
    /// affected binaries returned. An include change recompiles every stage.
    pub fn poll(&self) -> Vec<PathBuf> {
        let mut changed = BTreeSet::new();
        while let Ok(path) = self.rx.try_recv() {
            changed.insert(path);
        }
        if changed.is_empty() {
            return Vec::new();
        }

        let mut binaries = BTreeSet::new();
        for source in sources_to_compile(changed, || self.stage_sources()) {
            match compile_shader(&source) {
                Ok(binary) => {
                    binaries.insert(binary);
                }
                // Keep the old pipeline running with the last good binary
                Err(e) => log::error!("Shader hot reload failed: {:?}", e),
            }
        }
        binaries.into_iter().collect()
    }

    fn stage_sources(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_stage_source(p))
                .collect(),
            Err(e) => {
                log::warn!("Failed to list {:?}: {}", self.dir, e);
                Vec::new()
            }
        }
    }
}

/// Queue of update events, fed by the frame loop and the shader watcher.
#[derive(Default)]
pub struct Updater {
    watcher: Option<ShaderWatcher>,
    pending: Vec<UpdateEvent>,
}

impl Updater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shader_watcher(watcher: ShaderWatcher) -> Self {
        Self { watcher: Some(watcher), pending: Vec::new() }
    }

    pub fn push(&mut self, event: UpdateEvent) {
        self.pending.push(event);
    }

    /// Events since the last poll. Only the latest swapchain change is kept.
    pub fn poll(&mut self) -> Vec<UpdateEvent> {
        if let Some(watcher) = &self.watcher {
            let binaries = watcher.poll();
            if !binaries.is_empty() {
                self.pending.push(UpdateEvent::ShadersChanged(binaries));
            }
        }

        let mut events = std::mem::take(&mut self.pending);
        if let Some(last) = events.iter().rposition(|e| matches!(e, UpdateEvent::SwapchainChanged { .. })) {
            let mut index = 0;
            events.retain(|e| {
                let keep = !matches!(e, UpdateEvent::SwapchainChanged { .. }) || index == last;
                index += 1;
                keep
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_and_binaries_affect_their_pipeline() {
        let shader = Path::new("shaders/sky_gradient.frag.spv");
        assert!(affects(shader, Path::new("/abs/shaders/sky_gradient.frag")));
        assert!(affects(shader, Path::new("shaders/sky_gradient.frag.spv")));
        assert!(!affects(shader, Path::new("shaders/sky_gradient.vert")));
        assert!(!affects(shader, Path::new("shaders/lightsource_limits.glsl")));
    }

    #[test]
    fn keeps_only_latest_swapchain_change() {
        let mut updater = Updater::new();
        updater.push(UpdateEvent::SwapchainChanged { aspect_ratio: 1.0 });
        updater.push(UpdateEvent::ShadersChanged(vec![PathBuf::from("a.vert.spv")]));
        updater.push(UpdateEvent::SwapchainChanged { aspect_ratio: 2.0 });

        let events = updater.poll();
        assert_eq!(
            events,
            vec![
                UpdateEvent::ShadersChanged(vec![PathBuf::from("a.vert.spv")]),
                UpdateEvent::SwapchainChanged { aspect_ratio: 2.0 },
            ]
        );
        assert!(updater.poll().is_empty());
    }

    #[test]
    fn compiled_binaries_do_not_trigger_another_reload() {
        let changed = vec![PathBuf::from("shaders/sky_gradient.frag"), PathBuf::from("shaders/sky_gradient.frag.spv")];
        let sources = sources_to_compile(changed, Vec::new);
        assert_eq!(sources.into_iter().collect::<Vec<_>>(), vec![PathBuf::from("shaders/sky_gradient.frag")]);

        // The write from that compile arrives in the next batch on its own
        let sources = sources_to_compile(vec![PathBuf::from("shaders/sky_gradient.frag.spv")], Vec::new);
        assert!(sources.is_empty());
    }

    #[test]
    fn include_change_recompiles_every_stage() {
        let stages = || vec![PathBuf::from("a.vert"), PathBuf::from("b.frag")];
        let sources = sources_to_compile(vec![PathBuf::from("lightsource_limits.glsl")], stages);
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn stage_kinds() {
        assert!(is_stage_source(Path::new("x.vert")));
        assert!(is_stage_source(Path::new("x.frag")));
        assert!(!is_stage_source(Path::new("x.frag.spv")));
        assert!(is_include(Path::new("lightsource_limits.glsl")));
    }
}
