//! CPU topology tree.
//!
//! System → Socket → Tile → Core → Thread, where a tile groups the cores
//! sharing an L2 cache and every thread owns a stable OS CPU id. Offline
//! CPUs simply do not appear. The tree is a plain value type built once
//! at discovery and cloned out to callers.

pub mod discovery;

use rustc_hash::FxHashMap;

/// Where one OS CPU sits in the package hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLocation {
    pub os_id: u32,
    pub socket: u32,
    pub tile: u32,
    pub core: u32,
    pub thread: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadEntry {
    pub os_id: u32,
    /// SMT thread number within the core.
    pub thread_id: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CoreEntry {
    pub id: u32,
    pub threads: Vec<ThreadEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct TileEntry {
    pub id: u32,
    pub cores: Vec<CoreEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Socket {
    pub id: u32,
    pub tiles: Vec<TileEntry>,
}

impl Socket {
    pub fn cores(&self) -> impl Iterator<Item = &CoreEntry> {
        self.tiles.iter().flat_map(|t| t.cores.iter())
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadEntry> {
        self.cores().flat_map(|c| c.threads.iter())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemTopology {
    pub sockets: Vec<Socket>,
    locations: FxHashMap<u32, CpuLocation>,
}

impl SystemTopology {
    /// Builds the tree from flat per-CPU locations. Socket ids are
    /// renumbered into a dense prefix of the naturals in ascending
    /// hardware order; core and tile ids keep their hardware values.
    pub fn from_locations(mut locations: Vec<CpuLocation>) -> SystemTopology {
        locations.sort_by_key(|l| (l.socket, l.tile, l.core, l.thread, l.os_id));

        let mut hw_socket_ids: Vec<u32> = locations.iter().map(|l| l.socket).collect();
        hw_socket_ids.sort_unstable();
        hw_socket_ids.dedup();

        let mut sockets = Vec::with_capacity(hw_socket_ids.len());
        let mut map = FxHashMap::default();
        for (dense_id, hw_id) in hw_socket_ids.iter().enumerate() {
            let mut socket = Socket {
                id: dense_id as u32,
                tiles: Vec::new(),
            };
            for loc in locations.iter().filter(|l| l.socket == *hw_id) {
                let mut loc = *loc;
                loc.socket = dense_id as u32;
                map.insert(loc.os_id, loc);

                if socket.tiles.last().map(|t| t.id) != Some(loc.tile) {
                    socket.tiles.push(TileEntry {
                        id: loc.tile,
                        cores: Vec::new(),
                    });
                }
                let tile = socket.tiles.last_mut().expect("tile just pushed");
                if tile.cores.last().map(|c| c.id) != Some(loc.core) {
                    tile.cores.push(CoreEntry {
                        id: loc.core,
                        threads: Vec::new(),
                    });
                }
                tile.cores.last_mut().expect("core just pushed").threads.push(ThreadEntry {
                    os_id: loc.os_id,
                    thread_id: loc.thread,
                });
            }
            sockets.push(socket);
        }

        SystemTopology {
            sockets,
            locations: map,
        }
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Number of online logical CPUs.
    pub fn num_online_threads(&self) -> usize {
        self.locations.len()
    }

    /// Number of online physical cores across all sockets.
    pub fn num_cores(&self) -> usize {
        self.sockets.iter().map(|s| s.cores().count()).sum()
    }

    /// Maximum SMT width observed on any core.
    pub fn threads_per_core(&self) -> usize {
        self.sockets
            .iter()
            .flat_map(|s| s.cores())
            .map(|c| c.threads.len())
            .max()
            .unwrap_or(1)
    }

    pub fn is_online(&self, os_id: u32) -> bool {
        self.locations.contains_key(&os_id)
    }

    pub fn location_of(&self, os_id: u32) -> Option<&CpuLocation> {
        self.locations.get(&os_id)
    }

    pub fn socket_of(&self, os_id: u32) -> Option<u32> {
        self.location_of(os_id).map(|l| l.socket)
    }

    pub fn core_of(&self, os_id: u32) -> Option<u32> {
        self.location_of(os_id).map(|l| l.core)
    }

    pub fn tile_of(&self, os_id: u32) -> Option<u32> {
        self.location_of(os_id).map(|l| l.tile)
    }

    pub fn thread_of(&self, os_id: u32) -> Option<u32> {
        self.location_of(os_id).map(|l| l.thread)
    }

    /// All online OS CPU ids in ascending order.
    pub fn os_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.locations.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Online OS CPU ids belonging to one socket, ascending.
    pub fn os_ids_of_socket(&self, socket: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .locations
            .values()
            .filter(|l| l.socket == socket)
            .map(|l| l.os_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// A representative online CPU per socket, used for socket-scope MSR
    /// reads (energy, package C-states).
    pub fn socket_ref_cpu(&self, socket: u32) -> Option<u32> {
        self.os_ids_of_socket(socket).first().copied()
    }

    /// Logical CPUs per socket, assuming a homogeneous system; used by
    /// the latency normalization.
    pub fn threads_per_socket(&self) -> usize {
        if self.sockets.is_empty() {
            0
        } else {
            self.num_online_threads() / self.sockets.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_socket_topology() -> SystemTopology {
        let mut locations = Vec::new();
        // Two sockets with non-dense hardware ids (0 and 3), two tiles of
        // two cores each, two SMT threads per core.
        for (si, hw_socket) in [0u32, 3u32].iter().enumerate() {
            for tile in 0..2u32 {
                for core_in_tile in 0..2u32 {
                    let core = tile * 2 + core_in_tile;
                    for thread in 0..2u32 {
                        let os_id =
                            (si as u32) * 8 + core * 2 + thread;
                        locations.push(CpuLocation {
                            os_id,
                            socket: *hw_socket,
                            tile,
                            core,
                            thread,
                        });
                    }
                }
            }
        }
        SystemTopology::from_locations(locations)
    }

    #[test]
    fn socket_ids_are_a_dense_prefix() {
        let topo = two_socket_topology();
        let ids: Vec<u32> = topo.sockets.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn every_online_cpu_appears_in_exactly_one_thread() {
        let topo = two_socket_topology();
        let mut seen = Vec::new();
        for socket in &topo.sockets {
            for thread in socket.threads() {
                seen.push(thread.os_id);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, topo.os_ids());
        assert_eq!(seen.len(), topo.num_online_threads());
    }

    #[test]
    fn lookup_roundtrip() {
        let topo = two_socket_topology();
        for os_id in topo.os_ids() {
            let socket = topo.socket_of(os_id).expect("online cpu has a socket");
            assert!(topo.os_ids_of_socket(socket).contains(&os_id));
            let loc = topo.location_of(os_id).expect("online cpu has a location");
            assert_eq!(loc.os_id, os_id);
        }
        assert!(topo.location_of(1000).is_none());
    }

    #[test]
    fn counts_and_ref_cores() {
        let topo = two_socket_topology();
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.num_cores(), 8);
        assert_eq!(topo.num_online_threads(), 16);
        assert_eq!(topo.threads_per_core(), 2);
        assert_eq!(topo.socket_ref_cpu(0), Some(0));
        assert_eq!(topo.socket_ref_cpu(1), Some(8));
        assert_eq!(topo.threads_per_socket(), 8);
    }

    #[test]
    fn core_ids_unique_within_socket() {
        let topo = two_socket_topology();
        for socket in &topo.sockets {
            let mut core_ids: Vec<u32> = socket.cores().map(|c| c.id).collect();
            let total = core_ids.len();
            core_ids.sort_unstable();
            core_ids.dedup();
            assert_eq!(core_ids.len(), total);
        }
    }
}
