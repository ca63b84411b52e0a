//! Linux-specific detection

use super::Distro;
use std::path::Path;

const SYNOLOGY_MARKER: &str = "/usr/syno";

pub fn detect_distro() -> Distro {
    distro_from_root(Path::new("/"))
}

fn distro_from_root(root: &Path) -> Distro {
    let marker = SYNOLOGY_MARKER.trim_start_matches('/');
    if root.join(marker).is_dir() {
        Distro::Synology
    } else {
        Distro::Generic
    }
}
