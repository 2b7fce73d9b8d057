//! Argument lists for xorriso runs.
//!
//! Arguments are passed as a vector straight to the process, never through a
//! shell, so paths with spaces or quotes need no escaping.

use crate::core::models::{BlankMode, FormatMode};
use crate::core::project::{BurnOptions, Project};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XorrisoCommand {
    args: Vec<String>,
}

impl XorrisoCommand {
    pub fn new() -> Self {
        Self::default()
    }

    fn add<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn toggle(&mut self, option: &str, on: bool) -> &mut Self {
        self.add([option, if on { "on" } else { "off" }])
    }

    pub fn dev(&mut self, device: &str) -> &mut Self {
        self.add(["-dev", device])
    }

    pub fn indev(&mut self, device: &str) -> &mut Self {
        self.add(["-indev", device])
    }

    pub fn outdev(&mut self, device: &str) -> &mut Self {
        self.add(["-outdev", device])
    }

    pub fn device_links(&mut self) -> &mut Self {
        self.add(["-device_links"])
    }

    pub fn toc(&mut self) -> &mut Self {
        self.add(["-toc"])
    }

    pub fn tell_media_space(&mut self) -> &mut Self {
        self.add(["-tell_media_space"])
    }

    pub fn list_speeds(&mut self) -> &mut Self {
        self.add(["-list_speeds"])
    }

    pub fn list_profiles(&mut self, which: &str) -> &mut Self {
        self.add(["-list_profiles", which])
    }

    pub fn volid(&mut self, id: &str) -> &mut Self {
        self.add(["-volid", id])
    }

    pub fn rockridge(&mut self, on: bool) -> &mut Self {
        self.toggle("-rockridge", on)
    }

    pub fn joliet(&mut self, on: bool) -> &mut Self {
        self.toggle("-joliet", on)
    }

    pub fn md5(&mut self, on: bool) -> &mut Self {
        self.toggle("-md5", on)
    }

    pub fn for_backup(&mut self) -> &mut Self {
        self.add(["-for_backup"])
    }

    pub fn map(&mut self, source: &str, dest: &str) -> &mut Self {
        self.add(["-map", source, dest])
    }

    pub fn speed(&mut self, speed: &str) -> &mut Self {
        self.add(["-speed", speed])
    }

    pub fn dummy(&mut self, on: bool) -> &mut Self {
        self.toggle("-dummy", on)
    }

    pub fn close(&mut self, on: bool) -> &mut Self {
        self.toggle("-close", on)
    }

    pub fn stream_recording(&mut self, on: bool) -> &mut Self {
        self.toggle("-stream_recording", on)
    }

    pub fn padding(&mut self, kib: u32) -> &mut Self {
        self.add(["-padding".to_string(), format!("{kib}k")])
    }

    pub fn commit(&mut self) -> &mut Self {
        self.add(["-commit"])
    }

    pub fn eject(&mut self) -> &mut Self {
        self.add(["-eject", "all"])
    }

    pub fn blank(&mut self, mode: BlankMode) -> &mut Self {
        let mode = match mode {
            BlankMode::Full => "all",
            other => other.as_str(),
        };
        self.add(["-blank", mode])
    }

    pub fn format(&mut self, mode: FormatMode) -> &mut Self {
        self.add(["-format", mode.as_str()])
    }

    /// Read the whole disc back and report unreadable blocks.
    pub fn check_media(&mut self) -> &mut Self {
        self.add(["-check_media", "what=disc", "--"])
    }

    pub fn abort_on(&mut self, severity: &str) -> &mut Self {
        self.add(["-abort_on", severity])
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn build(&self) -> Vec<String> {
        self.args.clone()
    }

    /// Compose the image from the project and write it in one run.
    ///
    /// When a verify pass follows, the eject is left to it.
    pub fn burn(project: &Project, device: &str, options: &BurnOptions) -> Self {
        let mut cmd = Self::new();
        cmd.abort_on("FAILURE").outdev(device);

        let volid = if project.volume_id.is_empty() {
            &project.name
        } else {
            &project.volume_id
        };
        if !volid.is_empty() {
            cmd.volid(volid);
        }

        let iso = &project.iso_options;
        cmd.rockridge(iso.rock_ridge).joliet(iso.joliet).md5(iso.md5);
        if iso.backup_mode {
            cmd.for_backup();
        }

        for entry in &project.entries {
            let dest = if entry.dest_path.starts_with('/') {
                entry.dest_path.clone()
            } else {
                format!("/{}", entry.dest_path)
            };
            cmd.map(&entry.source_path, &dest);
        }

        if !options.speed.is_empty() && !options.speed.eq_ignore_ascii_case("auto") {
            cmd.speed(&options.speed);
        }
        cmd.dummy(options.dummy_mode)
            .close(options.close_disc)
            .stream_recording(options.stream_recording)
            .padding(options.padding)
            .commit();

        if options.eject && !options.verifies() {
            cmd.eject();
        }
        cmd
    }

    pub fn verify(device: &str, eject: bool) -> Self {
        let mut cmd = Self::new();
        cmd.indev(device).check_media();
        if eject {
            cmd.eject();
        }
        cmd
    }

    pub fn media_info(device: &str) -> Self {
        let mut cmd = Self::new();
        cmd.dev(device).toc().tell_media_space();
        cmd
    }
}
