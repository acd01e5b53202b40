use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ShmemError, ShmemResult};

/// the maximum number of PEs a context may span
pub const MAX_PES: usize = 16384;
/// the maximum number of live teams (world included)
pub const MAX_TEAMS: usize = 2048;

/// Handle to a team, valid only on the PEs that are members of it
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Team(pub(crate) usize);

impl Team {
    /// the team of every PE, always index 0
    pub const WORLD: Team = Team(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Per-team configuration record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub version: i32,
    pub num_contexts: i32,
    pub uniqueid: u64,
}

/// An error that occurs when trying to access a PE that does not exist on a team
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdError {
    pub world_pe: usize,
    pub team_pe: usize,
}

type ArchResult<T> = Result<T, IdError>;

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Invalid Id => world_pe:{} team_pe => {}",
            self.world_pe, self.team_pe
        )
    }
}

impl std::error::Error for IdError {}

/// A grouping of PEs of the form `start + i * stride` for `i < num_pes`,
/// expressed in world PE ids.
#[derive(Copy, Clone, std::hash::Hash, Debug, PartialEq, Eq)]
pub struct StridedArch {
    pub(crate) num_pes: usize,
    pub(crate) start_pe: usize,
    pub(crate) end_pe: usize,
    pub(crate) stride: usize,
}

impl StridedArch {
    pub fn new(start_pe: usize, stride: usize, num_team_pes: usize) -> StridedArch {
        StridedArch {
            num_pes: num_team_pes,
            start_pe,
            end_pe: start_pe + stride * num_team_pes.saturating_sub(1),
            stride,
        }
    }
    pub fn num_pes(&self) -> usize {
        self.num_pes
    }
    pub fn start_pe(&self) -> usize {
        self.start_pe
    }
    pub fn end_pe(&self) -> usize {
        self.end_pe
    }
    pub fn stride(&self) -> usize {
        self.stride
    }
    pub fn world_pe(&self, team_pe: usize) -> ArchResult<usize> {
        let world_pe = self.start_pe + team_pe * self.stride;
        if team_pe < self.num_pes {
            Ok(world_pe)
        } else {
            Err(IdError { world_pe, team_pe })
        }
    }
    pub fn team_pe(&self, world_pe: usize) -> ArchResult<usize> {
        if world_pe >= self.start_pe
            && world_pe <= self.end_pe
            && (world_pe - self.start_pe) % self.stride == 0
        {
            let team_pe = (world_pe - self.start_pe) / self.stride;
            if team_pe < self.num_pes {
                return Ok(team_pe);
            }
        }
        Err(IdError {
            world_pe,
            team_pe: 0,
        })
    }
    /// the world ids of the members, in team order
    pub fn team_iter(&self) -> impl Iterator<Item = usize> {
        let arch = *self;
        (0..arch.num_pes).map(move |i| arch.start_pe + i * arch.stride)
    }
}

/// One team as seen by one of its members
#[derive(Debug)]
pub(crate) struct TeamRecord {
    pub(crate) idx: usize,
    pub(crate) mype: usize,
    pub(crate) arch: StridedArch,
    pub(crate) config: TeamConfig,
    team_to_world: Vec<usize>,
    world_to_team: Vec<i32>,
}

impl TeamRecord {
    fn new(idx: usize, my_pe: usize, world_size: usize, arch: StridedArch) -> Option<TeamRecord> {
        let mype = arch.team_pe(my_pe).ok()?;
        let team_to_world: Vec<usize> = arch.team_iter().collect();
        let mut world_to_team = vec![-1i32; world_size];
        for (team_pe, world_pe) in team_to_world.iter().enumerate() {
            world_to_team[*world_pe] = team_pe as i32;
        }
        Some(TeamRecord {
            idx,
            mype,
            arch,
            config: TeamConfig::default(),
            team_to_world,
            world_to_team,
        })
    }
    pub(crate) fn size(&self) -> usize {
        self.arch.num_pes
    }
    pub(crate) fn stride(&self) -> usize {
        self.arch.stride
    }
    pub(crate) fn world_pe(&self, team_pe: usize) -> Option<usize> {
        self.team_to_world.get(team_pe).copied()
    }
    pub(crate) fn team_pe(&self, world_pe: usize) -> Option<usize> {
        match self.world_to_team.get(world_pe) {
            Some(pe) if *pe >= 0 => Some(*pe as usize),
            _ => None,
        }
    }
    pub(crate) fn members(&self) -> &[usize] {
        &self.team_to_world
    }
}

struct TeamPool {
    /// every index ever handed out, destroyed teams included
    mask: Vec<u64>,
    teams: Vec<Option<Arc<TeamRecord>>>,
}

/// number of `u64` words in a team index mask
pub(crate) const TEAM_MASK_WORDS: usize = MAX_TEAMS / 64;

/// first index that is clear in `mask`
fn first_free_idx(mask: &[u64]) -> Option<usize> {
    mask.iter()
        .enumerate()
        .find(|(_, word)| **word != u64::MAX)
        .map(|(w, word)| w * 64 + (!*word).trailing_zeros() as usize)
}

/// The table of teams this PE belongs to.
///
/// Team creation is collective over the parent team. The parent members
/// combine their used index masks before an index is picked, so every member
/// of the new team ends up with the same index (and the same sync slots).
/// Indices are never handed out twice within a context; a destroyed team's
/// sync slots keep their counters and cannot be shared by a later team.
pub(crate) struct TeamRegistry {
    my_pe: usize,
    num_pes: usize,
    pool: RwLock<TeamPool>,
}

impl std::fmt::Debug for TeamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamRegistry")
            .field("my_pe", &self.my_pe)
            .field("num_pes", &self.num_pes)
            .field("live", &self.live_teams())
            .finish()
    }
}

impl TeamRegistry {
    pub(crate) fn new(my_pe: usize, num_pes: usize) -> ShmemResult<TeamRegistry> {
        if num_pes == 0 || num_pes > MAX_PES || my_pe >= num_pes {
            return Err(ShmemError::InvalidParam(format!(
                "pe {} of {} (max {})",
                my_pe, num_pes, MAX_PES
            )));
        }
        let mut pool = TeamPool {
            mask: vec![0; TEAM_MASK_WORDS],
            teams: vec![None; MAX_TEAMS],
        };
        let world = TeamRecord::new(0, my_pe, num_pes, StridedArch::new(0, 1, num_pes))
            .ok_or_else(|| ShmemError::Inner("world team does not contain my pe".to_owned()))?;
        pool.mask[0] |= 1;
        pool.teams[0] = Some(Arc::new(world));
        Ok(TeamRegistry {
            my_pe,
            num_pes,
            pool: RwLock::new(pool),
        })
    }

    pub(crate) fn get(&self, team: Team) -> ShmemResult<Arc<TeamRecord>> {
        self.pool
            .read()
            .teams
            .get(team.0)
            .and_then(|t| t.clone())
            .ok_or_else(|| ShmemError::InvalidParam(format!("invalid team {}", team.0)))
    }

    pub(crate) fn is_valid(&self, team: Team) -> bool {
        self.get(team).is_ok()
    }

    pub(crate) fn live_teams(&self) -> Vec<Team> {
        self.pool
            .read()
            .teams
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(|(i, _)| Team(i))
            .collect()
    }

    /// the indices this PE has handed out so far
    pub(crate) fn used_mask(&self) -> Vec<u64> {
        self.pool.read().mask.clone()
    }

    /// Members get the new team, non-members get `Ok(None)`.
    ///
    /// `agree` receives the parent record and this PE's used mask and returns
    /// the union of the masks of every parent member.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn split_strided<F>(
        &self,
        parent: Team,
        start: usize,
        stride: usize,
        size: usize,
        agree: F,
    ) -> ShmemResult<Option<Team>>
    where
        F: FnOnce(&TeamRecord, &[u64]) -> ShmemResult<Vec<u64>>,
    {
        let parent_rec = self.get(parent)?;
        if start >= parent_rec.size() || size == 0 || size > parent_rec.size() || stride < 1 {
            return Err(ShmemError::InvalidParam(format!(
                "split of team {} (size {}) with start {} stride {} size {}",
                parent.0,
                parent_rec.size(),
                start,
                stride,
                size
            )));
        }
        let world_start = parent_rec
            .world_pe(start)
            .ok_or_else(|| ShmemError::InvalidParam(format!("start {} not in parent", start)))?;
        let world_stride = parent_rec.stride() * stride;
        let world_end = world_start + world_stride * (size - 1);
        if world_end >= self.num_pes {
            return Err(ShmemError::InvalidParam(format!(
                "team [start {} stride {} size {}] exceeds world size {}",
                world_start, world_stride, size, self.num_pes
            )));
        }
        let arch = StridedArch::new(world_start, world_stride, size);

        let union = agree(&parent_rec, &self.used_mask())?;
        let idx = first_free_idx(&union).ok_or_else(|| ShmemError::Inner("team pool exhausted".to_owned()))?;
        let mut pool = self.pool.write();
        pool.mask[idx / 64] |= 1 << (idx % 64);
        if arch.team_pe(self.my_pe).is_err() {
            debug!("pe {} is not a member of team {}", self.my_pe, idx);
            return Ok(None);
        }
        match TeamRecord::new(idx, self.my_pe, self.num_pes, arch) {
            Some(record) => {
                debug!(
                    "created team {} [start {} stride {} size {}] mype {}",
                    idx, world_start, world_stride, size, record.mype
                );
                pool.teams[idx] = Some(Arc::new(record));
                Ok(Some(Team(idx)))
            }
            None => Err(ShmemError::Inner(format!("unable to build team {}", idx))),
        }
    }

    /// Splits `parent` into rows of `x_range` PEs (x teams) and the columns
    /// across those rows (y teams). Returns this PE's x and y team.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn split_2d<F>(
        &self,
        parent: Team,
        x_range: usize,
        mut agree: F,
    ) -> ShmemResult<(Option<Team>, Option<Team>)>
    where
        F: FnMut(&TeamRecord, &[u64]) -> ShmemResult<Vec<u64>>,
    {
        if x_range == 0 {
            return Err(ShmemError::InvalidParam("x range must be larger than 0".to_owned()));
        }
        let src_size = self.get(parent)?.size();
        let x_range = x_range.min(src_size);
        let x_team_counts = (src_size + x_range - 1) / x_range;
        let remainder = src_size % x_range;

        let mut x_team = None;
        for i in 0..x_team_counts {
            let x_size = if i == x_team_counts - 1 && remainder != 0 {
                remainder
            } else {
                x_range
            };
            match self.split_strided(parent, i * x_range, 1, x_size, &mut agree) {
                Ok(Some(team)) => {
                    if x_team.replace(team).is_some() {
                        return Err(ShmemError::Inner("pe belongs to two x teams".to_owned()));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("create x-axis team {} of {} failed: {}", i + 1, x_team_counts, e),
            }
        }

        let y_range = src_size / x_range;
        let mut y_team = None;
        for i in 0..x_range {
            let y_size = if i < remainder { y_range + 1 } else { y_range };
            match self.split_strided(parent, i, x_range, y_size, &mut agree) {
                Ok(Some(team)) => {
                    if y_team.replace(team).is_some() {
                        return Err(ShmemError::Inner("pe belongs to two y teams".to_owned()));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("create y-axis team {} of {} failed: {}", i + 1, x_range, e),
            }
        }
        Ok((x_team, y_team))
    }

    /// `src_pe` of `src` expressed in `dst`, `None` if it is not a member of `dst`
    pub(crate) fn translate_pe(&self, src: Team, src_pe: usize, dst: Team) -> Option<usize> {
        let src = self.get(src).ok()?;
        let dst = self.get(dst).ok()?;
        dst.team_pe(src.world_pe(src_pe)?)
    }

    pub(crate) fn destroy(&self, team: Team) -> ShmemResult<()> {
        if team == Team::WORLD {
            return Err(ShmemError::InvalidParam("the world team cannot be destroyed".to_owned()));
        }
        let mut pool = self.pool.write();
        match pool.teams.get(team.0) {
            Some(Some(_)) => {
                pool.teams[team.0] = None;
                debug!("destroyed team {}", team.0);
                Ok(())
            }
            _ => {
                warn!("destroy of invalid team {}", team.0);
                Err(ShmemError::InvalidParam(format!("invalid team {}", team.0)))
            }
        }
    }

    /// drops every team, world included, and forgets every handed out index
    pub(crate) fn destroy_all(&self) {
        let mut pool = self.pool.write();
        pool.teams.iter_mut().for_each(|t| *t = None);
        pool.mask.iter_mut().for_each(|w| *w = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(_: &TeamRecord, mask: &[u64]) -> ShmemResult<Vec<u64>> {
        Ok(mask.to_vec())
    }

    #[test]
    fn strided_arch_ids() {
        let arch = StridedArch::new(1, 3, 4);
        assert_eq!(arch.end_pe(), 10);
        assert_eq!(arch.world_pe(2), Ok(7));
        assert_eq!(arch.team_pe(7), Ok(2));
        assert!(arch.team_pe(8).is_err());
        assert!(arch.world_pe(4).is_err());
        assert_eq!(arch.team_iter().collect::<Vec<_>>(), vec![1, 4, 7, 10]);
    }

    #[test]
    fn world_team() {
        let reg = TeamRegistry::new(3, 8).unwrap();
        let world = reg.get(Team::WORLD).unwrap();
        assert_eq!(world.mype, 3);
        assert_eq!(world.size(), 8);
        assert_eq!(world.stride(), 1);
        assert!(reg.destroy(Team::WORLD).is_err());
        assert!(TeamRegistry::new(8, 8).is_err());
    }

    #[test]
    fn split_even_odd() {
        for my_pe in 0..4 {
            let reg = TeamRegistry::new(my_pe, 4).unwrap();
            let even = reg.split_strided(Team::WORLD, 0, 2, 2, local).unwrap();
            if my_pe % 2 == 0 {
                let even = even.unwrap();
                assert_eq!(even, Team(1));
                let rec = reg.get(even).unwrap();
                assert_eq!(rec.mype, my_pe / 2);
                assert_eq!(reg.translate_pe(even, 1, Team::WORLD), Some(2));
                assert_eq!(reg.translate_pe(Team::WORLD, 2, even), Some(1));
                assert_eq!(reg.translate_pe(Team::WORLD, 3, even), None);
                reg.destroy(even).unwrap();
                assert!(!reg.is_valid(even));
            } else {
                assert_eq!(even, None);
            }
        }
    }

    #[test]
    fn split_validation() {
        let reg = TeamRegistry::new(0, 4).unwrap();
        assert!(matches!(
            reg.split_strided(Team::WORLD, 4, 1, 1, local),
            Err(ShmemError::InvalidParam(_))
        ));
        assert!(reg.split_strided(Team::WORLD, 0, 0, 1, local).is_err());
        assert!(reg.split_strided(Team::WORLD, 0, 1, 0, local).is_err());
        assert!(reg.split_strided(Team::WORLD, 0, 1, 5, local).is_err());
        assert!(reg.split_strided(Team::WORLD, 1, 2, 3, local).is_err());
        assert!(reg.split_strided(Team(7), 0, 1, 1, local).is_err());
    }

    #[test]
    fn nested_split_uses_world_ids() {
        // pe 4 of 8: odds = {1,3,5,7}, no; evens = {0,2,4,6}, then every other even = {0,4}
        let reg = TeamRegistry::new(4, 8).unwrap();
        let evens = reg.split_strided(Team::WORLD, 0, 2, 4, local).unwrap().unwrap();
        let sub = reg.split_strided(evens, 0, 2, 2, local).unwrap().unwrap();
        let rec = reg.get(sub).unwrap();
        assert_eq!(rec.members(), &[0, 4]);
        assert_eq!(rec.mype, 1);
        assert_eq!(reg.translate_pe(sub, 1, evens), Some(2));
    }

    #[test]
    fn split_2d_with_remainder() {
        // 7 pes in rows of 3: x = {0,1,2} {3,4,5} {6}; y = {0,3,6} {1,4} {2,5}
        let expected_x = [vec![0, 1, 2], vec![0, 1, 2], vec![0, 1, 2], vec![3, 4, 5], vec![3, 4, 5], vec![3, 4, 5], vec![6]];
        let expected_y = [vec![0, 3, 6], vec![1, 4], vec![2, 5], vec![0, 3, 6], vec![1, 4], vec![2, 5], vec![0, 3, 6]];
        for my_pe in 0..7 {
            let reg = TeamRegistry::new(my_pe, 7).unwrap();
            let (x, y) = reg.split_2d(Team::WORLD, 3, local).unwrap();
            assert_eq!(reg.get(x.unwrap()).unwrap().members(), expected_x[my_pe].as_slice());
            assert_eq!(reg.get(y.unwrap()).unwrap().members(), expected_y[my_pe].as_slice());
        }
    }

    #[test]
    fn split_2d_clamps_range() {
        let reg = TeamRegistry::new(1, 4).unwrap();
        let (x, y) = reg.split_2d(Team::WORLD, 10, local).unwrap();
        assert_eq!(reg.get(x.unwrap()).unwrap().size(), 4);
        assert_eq!(reg.get(y.unwrap()).unwrap().members(), &[1]);
        assert!(reg.split_2d(Team::WORLD, 0, local).is_err());
    }

    #[test]
    fn agreed_index_skips_indices_used_elsewhere() {
        let reg = TeamRegistry::new(0, 4).unwrap();
        // another parent member already handed out index 1
        let team = reg
            .split_strided(Team::WORLD, 0, 1, 4, |_, mask| {
                let mut union = mask.to_vec();
                union[0] |= 0b10;
                Ok(union)
            })
            .unwrap()
            .unwrap();
        assert_eq!(team, Team(2));
        // non-members still retire the index
        assert_eq!(reg.split_strided(Team::WORLD, 1, 1, 2, local).unwrap(), None);
        assert_eq!(reg.used_mask()[0], 0b111);
    }

    #[test]
    fn pool_exhaustion() {
        let reg = TeamRegistry::new(0, 2).unwrap();
        for _ in 1..MAX_TEAMS {
            reg.split_strided(Team::WORLD, 0, 1, 2, local).unwrap().unwrap();
        }
        assert!(matches!(
            reg.split_strided(Team::WORLD, 0, 1, 2, local),
            Err(ShmemError::Inner(_))
        ));
        // destroyed indices stay retired
        reg.destroy(Team(5)).unwrap();
        assert!(!reg.is_valid(Team(5)));
        assert!(reg.split_strided(Team::WORLD, 0, 1, 2, local).is_err());
        reg.destroy_all();
        assert!(reg.live_teams().is_empty());
    }
}
