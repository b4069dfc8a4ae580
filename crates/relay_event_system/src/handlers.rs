//! Handler trait, closure and typed wrappers, and the name registry.

use crate::{Event, EventError};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

/// Something that reacts to an [`Event`].
///
/// Most code never implements this directly and instead wraps a closure in
/// [`FnEventHandler`] or [`TypedEventHandler`].
pub trait EventHandler {
    /// Handles one event.
    fn handle(&self, event: &Event) -> Result<(), EventError>;

    /// Human-readable name used in logs.
    fn handler_name(&self) -> &str;
}

/// Adapts a closure over `&Event` into an [`EventHandler`].
pub struct FnEventHandler<F>
where
    F: Fn(&Event) -> Result<(), EventError>,
{
    handler: F,
    name: String,
}

impl<F> FnEventHandler<F>
where
    F: Fn(&Event) -> Result<(), EventError>,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            handler,
            name: name.into(),
        }
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&Event) -> Result<(), EventError>,
{
    fn handle(&self, event: &Event) -> Result<(), EventError> {
        (self.handler)(event)
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Type-safe wrapper that deserializes the event data into `T` first.
///
/// # Examples
///
/// ```rust
/// use relay_event_system::{Event, EventHandler, TypedEventHandler};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Join {
///     room: String,
/// }
///
/// let handler = TypedEventHandler::new("join", |join: Join, event: &Event| {
///     event.send(format!("joined {}", join.room))?;
///     Ok(())
/// });
/// assert_eq!(handler.handler_name(), "join");
/// ```
pub struct TypedEventHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T, &Event) -> Result<(), EventError>,
{
    handler: F,
    name: String,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, F> TypedEventHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T, &Event) -> Result<(), EventError>,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            handler,
            name: name.into(),
            _phantom: PhantomData,
        }
    }
}

impl<T, F> EventHandler for TypedEventHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T, &Event) -> Result<(), EventError>,
{
    fn handle(&self, event: &Event) -> Result<(), EventError> {
        let value = serde_json::from_value(event.data().clone()).map_err(EventError::Deserialization)?;
        (self.handler)(value, event)
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// How a route names its handler: a registry key such as `"Chat@send"`, or
/// the handler itself.
#[derive(Clone)]
pub enum HandlerRef {
    Named(String),
    Direct(Rc<dyn EventHandler>),
}

impl HandlerRef {
    /// Wraps a closure.
    pub fn from_fn<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Event) -> Result<(), EventError> + 'static,
    {
        Self::Direct(Rc::new(FnEventHandler::new(name, handler)))
    }

    /// Wraps a typed closure.
    pub fn typed<T, F>(name: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &Event) -> Result<(), EventError> + 'static,
    {
        Self::Direct(Rc::new(TypedEventHandler::new(name, handler)))
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
            HandlerRef::Direct(handler) => f.debug_tuple("Direct").field(&handler.handler_name()).finish(),
        }
    }
}

impl From<&str> for HandlerRef {
    fn from(name: &str) -> Self {
        HandlerRef::Named(name.to_string())
    }
}

impl From<String> for HandlerRef {
    fn from(name: String) -> Self {
        HandlerRef::Named(name)
    }
}

impl From<Rc<dyn EventHandler>> for HandlerRef {
    fn from(handler: Rc<dyn EventHandler>) -> Self {
        HandlerRef::Direct(handler)
    }
}

/// Maps stable string keys to handlers.
///
/// Named references are looked up once, when a route is registered; the
/// resolved handler is what the listener keeps.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Rc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `key`, replacing any previous entry.
    pub fn register(&mut self, key: impl Into<String>, handler: Rc<dyn EventHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    /// Registers a closure under `key`.
    pub fn register_fn<F>(&mut self, key: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> Result<(), EventError> + 'static,
    {
        let key = key.into();
        let handler = Rc::new(FnEventHandler::new(key.clone(), handler));
        self.handlers.insert(key, handler);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Turns a reference into a callable handler.
    pub fn resolve(&self, handler: HandlerRef) -> Result<Rc<dyn EventHandler>, EventError> {
        match handler {
            HandlerRef::Direct(handler) => Ok(handler),
            HandlerRef::Named(key) => self
                .handlers
                .get(&key)
                .cloned()
                .ok_or(EventError::HandlerNotFound(key)),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use serde::Deserialize;
    use std::cell::Cell;

    #[test]
    fn test_named_resolution() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("Chat@send", |_event| Ok(()));

        let handler = registry.resolve("Chat@send".into()).unwrap();
        assert_eq!(handler.handler_name(), "Chat@send");

        let missing = registry.resolve("Chat@missing".into());
        assert!(matches!(missing, Err(EventError::HandlerNotFound(key)) if key == "Chat@missing"));
    }

    #[test]
    fn test_typed_handler_deserializes_data() {
        #[derive(Deserialize)]
        struct Move {
            x: i32,
        }

        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        let handler = TypedEventHandler::new("move", move |m: Move, _event: &Event| {
            sink.set(m.x);
            Ok(())
        });

        let event = Event::new(EventKind::MessageReceived, None, r#"{"x": 12}"#);
        handler.handle(&event).unwrap();
        assert_eq!(seen.get(), 12);

        let bad = Event::new(EventKind::MessageReceived, None, r#"{"y": 1}"#);
        assert!(matches!(handler.handle(&bad), Err(EventError::Deserialization(_))));
    }
}
