pub mod value;
pub mod observable;
pub mod live_value;
pub mod derived;
pub mod live_list;
pub mod object;
pub mod binding;
pub mod text;
pub mod view;
pub mod binder;
pub mod error;

pub use binder::{BinderConfig, ElementHost, TreeBinder};
pub use binding::{BindingExpression, Direction};
pub use derived::{Computation, DerivedValue};
pub use error::BindError;
pub use live_list::{ElementModel, LiveList};
pub use live_value::{Coercion, LiveValue};
pub use object::{LiveObject, ModelSchema, PropertyDescriptor, PropertyHost};
pub use observable::{ChangeEvent, Observable};
pub use text::{LiveText, TextNodeBinding};
pub use value::Value;
pub use view::{LiveListView, View};
