//! Cache-occupancy and memory-bandwidth monitoring through the kernel's
//! resctrl filesystem.
//!
//! One monitor group is created per online CPU under `mon_groups`; each
//! group's `mon_data/mon_L3_XX` directories expose `llc_occupancy`,
//! `mbm_local_bytes` and `mbm_total_bytes` per socket, which the getters
//! sum across sockets. The engine prefers this bridge over direct QOS
//! MSR programming whenever resctrl is mounted. Cleanup removes the
//! directories it created.
//!
//! The root path is a parameter so tests can drive the bridge against a
//! scratch tree.

use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::topology::SystemTopology;

type FileMap = FxHashMap<u32, Vec<PathBuf>>;

pub struct Resctrl {
    root: PathBuf,
    cpus: Vec<u32>,
    num_sockets: usize,
    /// Directories this instance created, removed again on cleanup.
    created: Vec<PathBuf>,
    l3_occupancy: FileMap,
    mbl: FileMap,
    mbt: FileMap,
}

impl Resctrl {
    pub const DEFAULT_ROOT: &'static str = "/sys/fs/resctrl";

    pub fn is_mounted(root: impl AsRef<Path>) -> bool {
        root.as_ref().join("mon_groups").is_dir()
    }

    pub fn new(root: impl AsRef<Path>, topology: &SystemTopology) -> Resctrl {
        Resctrl {
            root: root.as_ref().to_path_buf(),
            cpus: topology.os_ids(),
            num_sockets: topology.num_sockets(),
            created: Vec::new(),
            l3_occupancy: FileMap::default(),
            mbl: FileMap::default(),
            mbt: FileMap::default(),
        }
    }

    /// Creates one monitor group per online CPU and records the metric
    /// file paths. When the primary tree is unwritable (typical in
    /// containers that mount resctrl read-only), groups are created
    /// under a container-local copy of the tree instead.
    pub fn init(&mut self) -> Result<()> {
        let cpus = self.cpus.clone();
        for cpu in cpus {
            let dir = self.root.join("mon_groups").join(format!("pcm{cpu}"));
            let dir = match self.create_group(&dir) {
                Some(dir) => dir,
                None => {
                    let relative = self
                        .root
                        .strip_prefix("/")
                        .unwrap_or(self.root.as_path())
                        .to_path_buf();
                    let fallback = Path::new("/pcm")
                        .join(relative)
                        .join("mon_groups")
                        .join(format!("pcm{cpu}"));
                    match self.create_group(&fallback) {
                        Some(dir) => dir,
                        None => {
                            log::error!(
                                "cannot create resctrl monitor groups; \
                                 L3OCC/MBL/MBT will not be available"
                            );
                            return Err(crate::error::Error::AccessDenied("resctrl mon_groups"));
                        }
                    }
                }
            };
            fs::write(dir.join("cpus_list"), format!("{cpu}"))?;
            for socket in 0..self.num_sockets {
                let mon = dir.join("mon_data").join(format!("mon_L3_{socket:02}"));
                self.l3_occupancy
                    .entry(cpu)
                    .or_default()
                    .push(mon.join("llc_occupancy"));
                self.mbl
                    .entry(cpu)
                    .or_default()
                    .push(mon.join("mbm_local_bytes"));
                self.mbt
                    .entry(cpu)
                    .or_default()
                    .push(mon.join("mbm_total_bytes"));
            }
        }
        Ok(())
    }

    fn create_group(&mut self, dir: &Path) -> Option<PathBuf> {
        if dir.is_dir() {
            return Some(dir.to_path_buf());
        }
        match fs::create_dir_all(dir) {
            Ok(()) => {
                self.created.push(dir.to_path_buf());
                Some(dir.to_path_buf())
            }
            Err(e) => {
                log::debug!("cannot create {}: {e}", dir.display());
                None
            }
        }
    }

    fn sum_metric(map: &FileMap, cpu: u32) -> u64 {
        let Some(files) = map.get(&cpu) else {
            return 0;
        };
        let mut total = 0;
        for file in files {
            match fs::read_to_string(file) {
                Ok(text) => total += text.trim().parse::<u64>().unwrap_or(0),
                Err(e) => log::debug!("error reading {}: {e}", file.display()),
            }
        }
        total
    }

    /// L3 occupancy of one CPU in bytes, summed across sockets.
    pub fn get_l3_occupancy(&self, cpu: u32) -> u64 {
        Self::sum_metric(&self.l3_occupancy, cpu)
    }

    /// Cumulative local memory traffic of one CPU in bytes.
    pub fn get_mbl(&self, cpu: u32) -> u64 {
        Self::sum_metric(&self.mbl, cpu)
    }

    /// Cumulative total memory traffic of one CPU in bytes.
    pub fn get_mbt(&self, cpu: u32) -> u64 {
        Self::sum_metric(&self.mbt, cpu)
    }

    /// Removes the monitor groups this instance created.
    pub fn cleanup(self) {
        for dir in self.created.iter().rev() {
            if let Err(e) = fs::remove_dir(dir) {
                log::debug!("cannot remove {}: {e}", dir.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{CpuLocation, SystemTopology};

    /// The bridge reports unreadable metric files through `log`; run the
    /// tests with RUST_LOG=debug to see them.
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn small_topology() -> SystemTopology {
        let locations = (0..4u32)
            .map(|os_id| CpuLocation {
                os_id,
                socket: os_id / 2,
                tile: 0,
                core: os_id % 2,
                thread: 0,
            })
            .collect();
        SystemTopology::from_locations(locations)
    }

    /// Builds a fake resctrl tree the way the kernel lays it out, with
    /// mon_data files pre-populated (the kernel creates those when a
    /// group directory is made; the test stands in for it).
    fn populate_mon_data(root: &Path, topology: &SystemTopology) {
        for cpu in topology.os_ids() {
            for socket in 0..topology.num_sockets() {
                let mon = root
                    .join("mon_groups")
                    .join(format!("pcm{cpu}"))
                    .join("mon_data")
                    .join(format!("mon_L3_{socket:02}"));
                std::fs::create_dir_all(&mon).expect("create mon_data");
                std::fs::write(mon.join("llc_occupancy"), format!("{}\n", 1000 + cpu)).unwrap();
                std::fs::write(mon.join("mbm_local_bytes"), "200\n").unwrap();
                std::fs::write(mon.join("mbm_total_bytes"), "500\n").unwrap();
            }
        }
    }

    #[test]
    fn detects_mounted_tree() {
        init_logging();
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(!Resctrl::is_mounted(tmp.path()));
        std::fs::create_dir_all(tmp.path().join("mon_groups")).unwrap();
        assert!(Resctrl::is_mounted(tmp.path()));
    }

    #[test]
    fn metrics_sum_across_sockets() {
        init_logging();
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("mon_groups")).unwrap();
        let topology = small_topology();
        let mut bridge = Resctrl::new(tmp.path(), &topology);
        bridge.init().expect("init");
        populate_mon_data(tmp.path(), &topology);

        // Two sockets, each file reporting the same value: the getter
        // sums them.
        assert_eq!(bridge.get_l3_occupancy(0), 2 * 1000);
        assert_eq!(bridge.get_l3_occupancy(3), 2 * 1003);
        assert_eq!(bridge.get_mbl(1), 2 * 200);
        assert_eq!(bridge.get_mbt(2), 2 * 500);
        // Unknown CPUs read as zero, not as errors.
        assert_eq!(bridge.get_mbt(99), 0);
    }

    #[test]
    fn cleanup_removes_created_groups() {
        init_logging();
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("mon_groups")).unwrap();
        let topology = small_topology();
        let mut bridge = Resctrl::new(tmp.path(), &topology);
        bridge.init().expect("init");
        let group = tmp.path().join("mon_groups").join("pcm0");
        assert!(group.is_dir());
        // On real resctrl the kernel owns the files inside a group and
        // drops them with the rmdir; the scratch tree needs a hand.
        for cpu in topology.os_ids() {
            let dir = tmp.path().join("mon_groups").join(format!("pcm{cpu}"));
            let _ = std::fs::remove_file(dir.join("cpus_list"));
        }
        bridge.cleanup();
        assert!(!group.exists());
    }
}
