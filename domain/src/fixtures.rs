//! Standard dataset: two teams and four members.
//!
//! | member  | age | team  |
//! |---------|-----|-------|
//! | member1 | 10  | teamA |
//! | member2 | 20  | teamA |
//! | member3 | 30  | teamB |
//! | member4 | 40  | teamB |

use tracing::debug;

use crate::session::Session;
use crate::{CoreError, Member, Store, Team};

/// Entities created by [`seed_basic`], with their identities assigned.
#[derive(Clone, Debug)]
pub struct Fixtures {
    pub team_a: Team,
    pub team_b: Team,
    pub members: Vec<Member>,
}

/// Persist the standard dataset, flush it and clear the session so later
/// reads come from the store.
pub fn seed_basic<S: Store + ?Sized>(session: &mut Session<'_, S>) -> Result<Fixtures, CoreError> {
    let mut team_a = Team::new("teamA");
    let mut team_b = Team::new("teamB");
    session.persist(&mut team_a)?;
    session.persist(&mut team_b)?;

    let mut members = vec![
        Member::new("member1", 10, Some(&team_a)),
        Member::new("member2", 20, Some(&team_a)),
        Member::new("member3", 30, Some(&team_b)),
        Member::new("member4", 40, Some(&team_b)),
    ];
    for member in &mut members {
        session.persist(member)?;
    }
    session.flush()?;
    session.clear();
    debug!(teams = 2, members = members.len(), "seeded fixtures");
    Ok(Fixtures {
        team_a,
        team_b,
        members,
    })
}
