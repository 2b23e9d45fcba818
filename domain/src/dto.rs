//! Read-side DTOs filled through projections.

use serde::{Deserialize, Serialize};

use crate::projection::{Bean, FromTuple, Tuple};
use crate::CoreError;

/// Username and age of a member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberDto {
    pub username: Option<String>,
    pub age: i32,
}

impl MemberDto {
    pub fn new(username: Option<String>, age: i32) -> Self {
        Self { username, age }
    }

    pub fn set_username(&mut self, username: Option<String>) {
        self.username = username;
    }

    pub fn set_age(&mut self, age: i32) {
        self.age = age;
    }

    /// Setter registry for the bean strategy.
    pub fn bean() -> Bean<MemberDto> {
        Bean::new()
            .setter("username", MemberDto::set_username)
            .setter("age", MemberDto::set_age)
    }
}

impl FromTuple for MemberDto {
    fn from_tuple(tuple: &Tuple) -> Result<Self, CoreError> {
        let (username, age) = <(Option<String>, i32)>::from_tuple(tuple)?;
        Ok(Self::new(username, age))
    }
}

/// A member under different field names; filled from aliased columns
/// (`username as name`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserDto {
    pub name: Option<String>,
    pub age: i32,
}

impl FromTuple for UserDto {
    fn from_tuple(tuple: &Tuple) -> Result<Self, CoreError> {
        let (name, age) = <(Option<String>, i32)>::from_tuple(tuple)?;
        Ok(Self { name, age })
    }
}

/// One row of the member search: the member and, when present, its team.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberTeamDto {
    pub member_id: i64,
    pub username: Option<String>,
    pub age: i32,
    pub team_id: Option<i64>,
    pub team_name: Option<String>,
}

impl FromTuple for MemberTeamDto {
    fn from_tuple(tuple: &Tuple) -> Result<Self, CoreError> {
        let (member_id, username, age, team_id, team_name) =
            <(i64, Option<String>, i32, Option<i64>, Option<String>)>::from_tuple(tuple)?;
        Ok(Self {
            member_id,
            username,
            age,
            team_id,
            team_name,
        })
    }
}

/// Per-team aggregate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamStats {
    pub team_name: String,
    pub member_count: i64,
    pub average_age: Option<f64>,
    pub max_age: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{fields, Projection};
    use crate::value::Value;

    fn row(labels: &[&str], values: Vec<Value>) -> Tuple {
        Tuple::new(labels.iter().map(|l| l.to_string()).collect(), values).unwrap()
    }

    #[test]
    fn member_dto_three_ways() {
        let t = row(&["username", "age"], vec!["member1".into(), Value::Int(10)]);
        let expected = MemberDto::new(Some("member1".into()), 10);
        assert_eq!(MemberDto::from_tuple(&t).unwrap(), expected);
        assert_eq!(fields::<MemberDto>().project(&t).unwrap(), expected);
        assert_eq!(MemberDto::bean().project(&t).unwrap(), expected);
    }

    #[test]
    fn user_dto_needs_alias_for_named_strategies() {
        let unaliased = row(&["username", "age"], vec!["member1".into(), Value::Int(10)]);
        let dto = fields::<UserDto>().project(&unaliased).unwrap();
        assert_eq!(dto.name, None);

        let aliased = row(&["name", "age"], vec!["member1".into(), Value::Int(10)]);
        let dto = fields::<UserDto>().project(&aliased).unwrap();
        assert_eq!(dto.name.as_deref(), Some("member1"));
    }

    #[test]
    fn member_team_dto_from_left_join_row() {
        let t = row(
            &["id", "username", "age", "id", "name"],
            vec![Value::Int(5), "member5".into(), Value::Int(50), Value::Null, Value::Null],
        );
        let dto = MemberTeamDto::from_tuple(&t).unwrap();
        assert_eq!(dto.member_id, 5);
        assert_eq!(dto.team_id, None);
        assert_eq!(dto.team_name, None);
    }
}
