use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::Signal;
use rand::Rng;
use tokio::process::{Child, Command};

use crate::media::{shutdown_child, MediaError};

/// Upper bound for each child teardown step.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DisplayOptions {
    /// Pipeline id. Also names the null sink, which is what makes
    /// `<id>.monitor` capture exactly this pipeline's audio.
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A virtual screen with audio: Xvfb framebuffer, PulseAudio null sink and a
/// kiosk browser, owned as a group. Either all three are acquired or none.
pub struct Display {
    display_id: String,
    pulse_module: Option<String>,
    xvfb: Option<Child>,
    browser: Option<Child>,
    opts: DisplayOptions,
}

impl Display {
    pub fn new(opts: DisplayOptions) -> Self {
        Self {
            display_id: random_display(),
            pulse_module: None,
            xvfb: None,
            browser: None,
            opts,
        }
    }

    pub fn display_id(&self) -> &str {
        &self.display_id
    }

    pub fn width(&self) -> u32 {
        self.opts.width
    }

    pub fn height(&self) -> u32 {
        self.opts.height
    }

    /// Monitor source of this pipeline's null sink.
    pub fn pulse_monitor_id(&self) -> String {
        format!("{}.monitor", self.opts.id)
    }

    /// Brings the group up in order: framebuffer, audio sink, browser.
    /// A failure at any step rolls the earlier steps back before returning.
    pub async fn launch(&mut self, url: &str) -> Result<(), MediaError> {
        self.launch_display_server().await?;

        if let Err(err) = self.launch_audio_sink().await {
            self.close().await;
            return Err(err);
        }

        if let Err(err) = self.launch_browser(url).await {
            self.close().await;
            return Err(err);
        }

        Ok(())
    }

    async fn launch_display_server(&mut self) -> Result<(), MediaError> {
        if self.xvfb.is_some() {
            return Err(MediaError::AlreadyRunning("Xvfb"));
        }

        log::info!("starting Xvfb on {}", self.display_id);

        let child = Command::new("Xvfb")
            .args(xvfb_args(
                &self.display_id,
                self.opts.width,
                self.opts.height,
                self.opts.depth,
            ))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| MediaError::Spawn {
                binary: "Xvfb",
                source,
            })?;

        self.xvfb = Some(child);
        Ok(())
    }

    async fn launch_audio_sink(&mut self) -> Result<(), MediaError> {
        if self.pulse_module.is_some() {
            return Err(MediaError::AlreadyRunning("pulse sink"));
        }

        log::info!("loading null sink {}", self.opts.id);

        let output = Command::new("pactl")
            .args(sink_args(&self.opts.id))
            .output()
            .await
            .map_err(|source| MediaError::Spawn {
                binary: "pactl",
                source,
            })?;

        if !output.status.success() {
            return Err(MediaError::AudioSink(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        // pactl prints the module handle needed for unload.
        let module = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if module.is_empty() {
            return Err(MediaError::AudioSink(
                "pactl returned no module handle".to_string(),
            ));
        }

        log::info!("null sink {} loaded as module {module}", self.opts.id);
        self.pulse_module = Some(module);
        Ok(())
    }

    async fn launch_browser(&mut self, url: &str) -> Result<(), MediaError> {
        if self.browser.is_some() {
            return Err(MediaError::AlreadyRunning("browser"));
        }

        log::info!("launching browser on {} for {url}", self.display_id);

        let child = Command::new("chromium")
            .args(browser_args(
                &self.display_id,
                self.opts.width,
                self.opts.height,
                url,
            ))
            .env("PULSE_SINK", &self.opts.id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| MediaError::Spawn {
                binary: "chromium",
                source,
            })?;

        self.browser = Some(child);
        Ok(())
    }

    /// Tears the group down in reverse order. Idempotent; each step is
    /// bounded and escalates to SIGKILL when the grace period runs out.
    pub async fn close(&mut self) {
        log::info!("closing display {}", self.display_id);

        if let Some(mut browser) = self.browser.take() {
            if let Err(err) =
                shutdown_child("browser", &mut browser, Signal::SIGTERM, CLOSE_GRACE).await
            {
                log::warn!("browser shutdown failed: {err}");
            }
        }

        if let Some(mut xvfb) = self.xvfb.take() {
            match shutdown_child("Xvfb", &mut xvfb, Signal::SIGINT, CLOSE_GRACE).await {
                Ok(status) => log::info!("Xvfb stopped with {status}"),
                Err(err) => log::warn!("Xvfb shutdown failed: {err}"),
            }
        }

        if let Some(module) = self.pulse_module.take() {
            let unload = Command::new("pactl")
                .args(["unload-module", module.as_str()])
                .output()
                .await;
            match unload {
                Ok(output) if output.status.success() => {
                    log::info!("null sink module {module} unloaded")
                }
                Ok(output) => log::warn!(
                    "failed to unload sink module {module}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(err) => log::warn!("pactl unload-module failed: {err}"),
            }
        }
    }
}

/// Pseudo-random display number, three digits so it stays clear of real
/// seats and other pipelines.
fn random_display() -> String {
    format!(":{}", rand::thread_rng().gen_range(100..1100))
}

fn xvfb_args(display_id: &str, width: u32, height: u32, depth: u32) -> Vec<String> {
    vec![
        display_id.to_string(),
        "-screen".to_string(),
        "0".to_string(),
        format!("{width}x{height}x{depth}"),
        "-ac".to_string(),
        "-nolisten".to_string(),
        "tcp".to_string(),
    ]
}

fn sink_args(id: &str) -> Vec<String> {
    vec![
        "load-module".to_string(),
        "module-null-sink".to_string(),
        format!("sink_name={id}"),
        format!("sink_properties=device.description={id}"),
    ]
}

fn browser_args(display_id: &str, width: u32, height: u32, url: &str) -> Vec<String> {
    vec![
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--no-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-extensions".to_string(),
        "--disable-popup-blocking".to_string(),
        "--disable-sync".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        "--kiosk".to_string(),
        "--window-position=0,0".to_string(),
        format!("--window-size={width},{height}"),
        format!("--display={display_id}"),
        url.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_display_stays_in_range() {
        for _ in 0..100 {
            let id = random_display();
            let number: u32 = id.strip_prefix(':').unwrap().parse().unwrap();
            assert!((100..1100).contains(&number), "display {id} out of range");
        }
    }

    #[test]
    fn xvfb_args_carry_dimensions() {
        let args = xvfb_args(":205", 1280, 720, 24);
        assert_eq!(args[0], ":205");
        assert!(args.contains(&"1280x720x24".to_string()));
        assert!(args.contains(&"-nolisten".to_string()));
    }

    #[test]
    fn sink_is_named_by_pipeline_id() {
        let args = sink_args("pipeline_7");
        assert!(args.contains(&"module-null-sink".to_string()));
        assert!(args.contains(&"sink_name=pipeline_7".to_string()));
    }

    #[test]
    fn monitor_source_matches_sink_name() {
        let display = Display::new(DisplayOptions {
            id: "pipeline_7".to_string(),
            width: 1280,
            height: 720,
            depth: 24,
        });
        assert_eq!(display.pulse_monitor_id(), "pipeline_7.monitor");
    }

    #[test]
    fn browser_runs_kiosk_on_the_virtual_display() {
        let args = browser_args(":205", 1280, 720, "http://localhost:8000/page");
        assert!(args.contains(&"--kiosk".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.contains(&"--display=:205".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert_eq!(args.last().unwrap(), "http://localhost:8000/page");
    }
}
