use std::path::PathBuf;

use camprobe::ui::{StatusLog, UiSink};
use image::RgbImage;
use log::{info, warn};

/// Terminal stand-in for the camera screen: prints the status log as it grows
/// and keeps the most recent frame, optionally mirrored to a PNG on disk.
pub struct Viewer {
    log: StatusLog,
    frame: Option<RgbImage>,
    frames_shown: usize,
    output: Option<PathBuf>,
    echo: bool,
}

impl Viewer {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self {
            log: StatusLog::default(),
            frame: None,
            frames_shown: 0,
            output,
            echo: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn log(&self) -> &StatusLog {
        &self.log
    }

    pub fn frame(&self) -> Option<&RgbImage> {
        self.frame.as_ref()
    }

    pub fn frames_shown(&self) -> usize {
        self.frames_shown
    }
}

impl UiSink for Viewer {
    fn status(&mut self, line: &str) {
        if self.echo {
            println!("{}", line);
        }
        self.log.push(line);
    }

    fn display(&mut self, image: RgbImage) {
        self.frames_shown += 1;

        if let Some(path) = &self.output {
            match image.save(path) {
                Ok(_) => info!(
                    "frame {} ({}x{}) written to {}",
                    self.frames_shown,
                    image.width(),
                    image.height(),
                    path.display()
                ),
                Err(err) => warn!("could not write {}: {}", path.display(), err),
            }
        }

        self.frame = Some(image);
    }
}
