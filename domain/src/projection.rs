//! Result rows and the strategies that turn them into caller types.
//!
//! A [`Tuple`] is one result row with its column labels. Three projection
//! strategies map tuples onto DTOs:
//!
//! * constructor: positional, through [`FromTuple`] or a closure;
//! * fields: by label, through serde (`Deserialize`);
//! * bean: by label, through a registry of setter closures on a `Default`
//!   value.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::{Map, Number};

use crate::value::{FromValue, Value};
use crate::CoreError;

/// One result row.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    labels: Vec<String>,
    values: Vec<Value>,
}

impl Tuple {
    pub fn new(labels: Vec<String>, values: Vec<Value>) -> Result<Self, CoreError> {
        if labels.len() != values.len() {
            return Err(CoreError::Mapping(format!(
                "{} labels for {} values",
                labels.len(),
                values.len()
            )));
        }
        Ok(Self { labels, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Typed positional access.
    pub fn get_as<T: FromValue>(&self, idx: usize) -> Result<T, CoreError> {
        let value = self.get(idx).ok_or_else(|| {
            CoreError::Mapping(format!("column {idx} out of range for {} columns", self.len()))
        })?;
        T::from_value(value)
    }

    /// First column carrying `label`.
    pub fn by_label(&self, label: &str) -> Option<&Value> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| &self.values[i])
    }

    /// Columns `start..start + len` as their own tuple.
    pub fn slice(&self, start: usize, len: usize) -> Result<Tuple, CoreError> {
        let end = start + len;
        if end > self.len() {
            return Err(CoreError::Mapping(format!(
                "columns {start}..{end} out of range for {} columns",
                self.len()
            )));
        }
        Ok(Tuple {
            labels: self.labels[start..end].to_vec(),
            values: self.values[start..end].to_vec(),
        })
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

/// Maps a tuple onto `T`.
pub trait Projection<T> {
    fn project(&self, tuple: &Tuple) -> Result<T, CoreError>;
}

/// Positional construction from a whole tuple.
pub trait FromTuple: Sized {
    fn from_tuple(tuple: &Tuple) -> Result<Self, CoreError>;
}

fn check_arity(tuple: &Tuple, arity: usize) -> Result<(), CoreError> {
    if tuple.len() == arity {
        Ok(())
    } else {
        Err(CoreError::Mapping(format!(
            "constructor takes {arity} arguments, row has {} columns",
            tuple.len()
        )))
    }
}

macro_rules! tuple_from_tuple {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name: FromValue),+> FromTuple for ($($name,)+) {
            fn from_tuple(tuple: &Tuple) -> Result<Self, CoreError> {
                check_arity(tuple, $arity)?;
                Ok(($(tuple.get_as::<$name>($idx)?,)+))
            }
        }
    };
}

tuple_from_tuple!(1; A: 0);
tuple_from_tuple!(2; A: 0, B: 1);
tuple_from_tuple!(3; A: 0, B: 1, C: 2);
tuple_from_tuple!(4; A: 0, B: 1, C: 2, D: 3);
tuple_from_tuple!(5; A: 0, B: 1, C: 2, D: 3, E: 4);

impl FromTuple for Tuple {
    fn from_tuple(tuple: &Tuple) -> Result<Self, CoreError> {
        Ok(tuple.clone())
    }
}

/// Constructor projection through [`FromTuple`].
pub struct Constructor<T>(PhantomData<fn() -> T>);

impl<T: FromTuple> Projection<T> for Constructor<T> {
    fn project(&self, tuple: &Tuple) -> Result<T, CoreError> {
        T::from_tuple(tuple)
    }
}

/// Constructor projection through a closure over the positional arguments.
pub struct ConstructorFn<A, T, F> {
    ctor: F,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T, F> Projection<T> for ConstructorFn<A, T, F>
where
    A: FromTuple,
    F: Fn(A) -> T,
{
    fn project(&self, tuple: &Tuple) -> Result<T, CoreError> {
        A::from_tuple(tuple).map(&self.ctor)
    }
}

/// Constructor strategy: positional arguments in select order.
pub fn constructor<T: FromTuple>() -> Constructor<T> {
    Constructor(PhantomData)
}

/// Constructor strategy with an explicit constructor function.
///
/// `constructor_fn(|(username, age)| MemberDto::new(username, age))`
pub fn constructor_fn<A, T, F>(ctor: F) -> ConstructorFn<A, T, F>
where
    A: FromTuple,
    F: Fn(A) -> T,
{
    ConstructorFn {
        ctor,
        _marker: PhantomData,
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value, CoreError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Int(v) => serde_json::Value::Number((*v).into()),
        Value::Real(v) => Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .ok_or_else(|| CoreError::Mapping(format!("{v} is not representable")))?,
        Value::Text(s) => serde_json::Value::String(s.clone()),
    })
}

/// Field strategy: each labeled column fills the field of the same name.
///
/// Columns with no matching field are ignored and fields with no matching
/// column keep their serde default, so DTOs opt in with `#[serde(default)]`.
pub struct Fields<T>(PhantomData<fn() -> T>);

pub fn fields<T: DeserializeOwned>() -> Fields<T> {
    Fields(PhantomData)
}

impl<T: DeserializeOwned> Projection<T> for Fields<T> {
    fn project(&self, tuple: &Tuple) -> Result<T, CoreError> {
        let mut object = Map::with_capacity(tuple.len());
        for (label, value) in tuple.labels.iter().zip(&tuple.values) {
            object.insert(label.clone(), to_json(value)?);
        }
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| CoreError::Mapping(e.to_string()))
    }
}

type Setter<T> = Box<dyn Fn(&mut T, &Value) -> Result<(), CoreError> + Send + Sync>;

/// Bean strategy: start from `T::default()` and call the registered setter
/// for every column whose label has one. Unregistered labels are skipped.
pub struct Bean<T> {
    setters: HashMap<String, Setter<T>>,
}

impl<T: Default> Bean<T> {
    pub fn new() -> Self {
        Self {
            setters: HashMap::new(),
        }
    }

    /// Register the setter for `label`; the column converts through
    /// [`FromValue`] before the setter sees it.
    pub fn setter<V, F>(mut self, label: &str, set: F) -> Self
    where
        T: 'static,
        V: FromValue + 'static,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let setter: Setter<T> = Box::new(move |target: &mut T, value: &Value| {
            set(target, V::from_value(value)?);
            Ok(())
        });
        self.setters.insert(label.to_string(), setter);
        self
    }
}

impl<T: Default> Default for Bean<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> Projection<T> for Bean<T> {
    fn project(&self, tuple: &Tuple) -> Result<T, CoreError> {
        let mut target = T::default();
        for (label, value) in tuple.labels.iter().zip(&tuple.values) {
            if let Some(set) = self.setters.get(label) {
                set(&mut target, value)
                    .map_err(|e| CoreError::Mapping(format!("setter `{label}`: {e}")))?;
            }
        }
        Ok(target)
    }
}
