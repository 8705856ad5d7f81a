//! Serializer behavior: canonical JSON, extensions, type registry binding.

use std::collections::BTreeMap;
use std::sync::Arc;

use bandsaw::models::value::SerializableValue;
use bandsaw::models::{ExceptionValue, NamedTupleType, ObjectValue, Tuple, Value};
use bandsaw::serialization::extensions::ValueExtension;
use bandsaw::serialization::json::{TAG_KEY, FORM_KEY};
use bandsaw::serialization::{
    BinarySerializer, JsonSerializer, Serializer, SerializerKind, TypeRegistry,
};
use bandsaw::{BandsawError, Result};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq)]
struct Temperature {
    celsius: i64,
}

impl SerializableValue for Temperature {
    const TYPE_NAME: &'static str = "Temperature";
    const MODULE: &'static str = "weather";

    fn serialized(&self) -> Value {
        Value::Int(self.celsius)
    }

    fn deserialize(value: Value) -> Result<Self> {
        value
            .as_int()
            .map(|celsius| Self { celsius })
            .ok_or_else(|| BandsawError::Serialization("temperature must be an int".into()))
    }
}

fn point_type() -> NamedTupleType {
    NamedTupleType::new("geo", "Point", &["x", "y"])
}

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry
        .register_object::<Temperature>()
        .register_named_tuple(point_type())
        .register_exception("weather", "StormWarning");
    Arc::new(registry)
}

fn rich_value() -> Value {
    let mut map = BTreeMap::new();
    map.insert("bytes".to_owned(), Value::Bytes(vec![0, 159, 255]));
    map.insert(
        "point".to_owned(),
        Tuple::named(point_type(), vec![Value::Int(1), Value::Float(2.5)])
            .unwrap()
            .into(),
    );
    map.insert(
        "plain".to_owned(),
        Tuple::plain(vec![Value::Null, Value::from("a")]).into(),
    );
    map.insert(
        "error".to_owned(),
        ExceptionValue::new("weather", "StormWarning", vec![Value::from("gale")]).into(),
    );
    map.insert(
        "object".to_owned(),
        ObjectValue::from_typed(&Temperature { celsius: -4 }).into(),
    );
    map.insert(
        "nested".to_owned(),
        Value::List(vec![Value::Bool(true), Value::Int(-7), Value::from("ü")]),
    );
    Value::Map(map)
}

#[test]
fn both_serializers_round_trip_rich_values() {
    let value = rich_value();
    for serializer in [
        SerializerKind::Json.build(registry()),
        SerializerKind::Binary.build(registry()),
    ] {
        let bytes = serializer.to_bytes(&value).unwrap();
        let decoded = serializer.from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value, "{} serializer", serializer.name());
    }
}

#[test]
fn json_output_is_canonical() {
    let serializer = JsonSerializer::new(registry());
    let mut map = BTreeMap::new();
    map.insert("b".to_owned(), Value::Int(1));
    map.insert("a".to_owned(), Value::List(vec![Value::Null, Value::Bool(false)]));
    let bytes = serializer.to_bytes(&Value::Map(map)).unwrap();
    assert_eq!(bytes, br#"{"a":[null,false],"b":1}"#);
}

#[test]
fn json_output_is_identical_for_equal_values() {
    let serializer = JsonSerializer::new(registry());
    let first = serializer.to_bytes(&rich_value()).unwrap();
    let second = serializer.to_bytes(&rich_value()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn json_tags_extension_values() {
    let serializer = JsonSerializer::new(registry());
    let json = serializer.to_json(&Value::Bytes(b"hi".to_vec())).unwrap();
    assert_eq!(json[TAG_KEY], Json::String("bytes".into()));
    assert_eq!(json[FORM_KEY], Json::String("aGk=".into()));
}

#[test]
fn json_rejects_non_finite_floats() {
    let serializer = JsonSerializer::new(registry());
    for number in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = serializer.to_bytes(&Value::Float(number)).unwrap_err();
        assert!(matches!(err, BandsawError::Serialization(_)), "{number}");
    }
}

#[test]
fn binary_keeps_non_finite_floats() {
    let serializer = BinarySerializer::new(registry());
    let bytes = serializer.to_bytes(&Value::Float(f64::INFINITY)).unwrap();
    assert_eq!(
        serializer.from_bytes(&bytes).unwrap(),
        Value::Float(f64::INFINITY)
    );
}

#[test]
fn json_rejects_reserved_map_key() {
    let serializer = JsonSerializer::new(registry());
    let mut map = BTreeMap::new();
    map.insert(TAG_KEY.to_owned(), Value::from("bytes"));
    let err = serializer.to_bytes(&Value::Map(map)).unwrap_err();
    assert!(matches!(err, BandsawError::Serialization(_)));
}

#[test]
fn json_unknown_tag_fails() {
    let serializer = JsonSerializer::new(registry());
    let err = serializer
        .from_bytes(br#"{"__bandsaw__":"complex","value":[1,2]}"#)
        .unwrap_err();
    assert!(matches!(err, BandsawError::Serialization(msg) if msg.contains("complex")));
}

#[test]
fn unknown_named_tuple_is_synthesized() {
    let written = JsonSerializer::new(registry())
        .to_bytes(
            &Tuple::named(
                NamedTupleType::new("shapes", "Size", &["w", "h"]),
                vec![Value::Int(3), Value::Int(4)],
            )
            .unwrap()
            .into(),
        )
        .unwrap();

    let decoded = JsonSerializer::new(registry()).from_bytes(&written).unwrap();
    let Value::Tuple(tuple) = decoded else {
        panic!("expected tuple");
    };
    let kind = tuple.kind.as_ref().unwrap();
    assert!(kind.synthesized);
    assert_eq!(kind.name, "Size");
    assert_eq!(tuple.field("h"), Some(&Value::Int(4)));
}

#[test]
fn known_named_tuple_is_bound_to_registered_type() {
    let serializer = BinarySerializer::new(registry());
    let tuple: Value = Tuple::named(point_type(), vec![Value::Int(0), Value::Int(1)])
        .unwrap()
        .into();
    let decoded = serializer
        .from_bytes(&serializer.to_bytes(&tuple).unwrap())
        .unwrap();
    let Value::Tuple(decoded) = decoded else {
        panic!("expected tuple");
    };
    assert!(!decoded.kind.unwrap().synthesized);
}

#[test]
fn unknown_exception_is_kept_best_effort() {
    let exception = ExceptionValue::new("elsewhere", "Unheard", vec![Value::Int(3)]);
    let serializer = JsonSerializer::new(Arc::new(TypeRegistry::empty()));
    let decoded = serializer
        .from_bytes(&serializer.to_bytes(&exception.clone().into()).unwrap())
        .unwrap();
    assert_eq!(decoded, Value::Exception(exception));
}

#[test]
fn unknown_object_type_fails_on_decode() {
    let value: Value = ObjectValue::from_typed(&Temperature { celsius: 20 }).into();
    for kind in [SerializerKind::Json, SerializerKind::Binary] {
        let bytes = kind.build(registry()).to_bytes(&value).unwrap();
        let err = kind
            .build(Arc::new(TypeRegistry::new()))
            .from_bytes(&bytes)
            .unwrap_err();
        assert_eq!(err, BandsawError::UnknownType("weather.Temperature".into()));
    }
}

#[test]
fn malformed_object_form_fails_through_its_type() {
    let value: Value = ObjectValue {
        type_name: "Temperature".into(),
        module: "weather".into(),
        serialized: Box::new(Value::from("warm")),
    }
    .into();
    let serializer = JsonSerializer::new(registry());
    let bytes = serializer.to_bytes(&value).unwrap();
    assert!(matches!(
        serializer.from_bytes(&bytes),
        Err(BandsawError::Serialization(_))
    ));
}

#[derive(Debug)]
struct UpperCaseStrings;

impl ValueExtension for UpperCaseStrings {
    fn tag(&self) -> &str {
        "upper"
    }

    fn can_serialize(&self, value: &Value) -> bool {
        matches!(value, Value::Str(_))
    }

    fn serialize_value(&self, value: &Value, _codec: &JsonSerializer) -> Result<Json> {
        Ok(Json::String(value.as_str().unwrap_or_default().to_uppercase()))
    }

    fn deserialize_value(&self, form: Json, _codec: &JsonSerializer) -> Result<Value> {
        Ok(Value::Str(form.as_str().unwrap_or_default().to_lowercase()))
    }
}

#[test]
fn later_extensions_take_priority() {
    let serializer =
        JsonSerializer::new(registry()).with_extension(Arc::new(UpperCaseStrings));
    let bytes = serializer.to_bytes(&Value::from("quiet")).unwrap();
    assert_eq!(bytes, br#"{"__bandsaw__":"upper","value":"QUIET"}"#);
    assert_eq!(serializer.from_bytes(&bytes).unwrap(), Value::from("quiet"));
}

#[test]
fn bandsaw_errors_round_trip_as_registered_exceptions() {
    let exception = ExceptionValue::from_error(&BandsawError::UnknownTask("x".into()));
    assert_eq!(exception.type_name, "BandsawError");
    let registry = TypeRegistry::new();
    assert!(registry.knows_exception(&exception.module, &exception.type_name));
}
