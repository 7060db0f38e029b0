use super::message::Message;
use super::message::MessageType;
use super::message::Payload;
use super::message::TransportMessage;
use json;

const TRANSPORT_MSG_JSON: &str = r#"{
    "to":"my-to",
    "from":"my-from",
    "thread":"my-thread",
    "body":[{
        "__c":"osrfMessage",
        "__p":{
            "threadTrace":1,
            "type":"REQUEST",
            "locale":"en-US",
            "timezone":"America/New_York",
            "api_level":1,
            "ingress":"opensrf",
            "payload":{
                "__c":"osrfMethod",
                "__p":{
                    "method":"opensrf.system.echo",
                    "params":["Hello","World"]
                }
            }
        }
    }]
}"#;

#[test]
fn parse_transport_message() {
    let json_value = json::parse(TRANSPORT_MSG_JSON).unwrap();
    let tm = TransportMessage::from_json_value(&json_value).unwrap();

    assert_eq!(tm.thread(), "my-thread");

    let msg = &tm.body()[0];
    let type_str: &str = (*msg.mtype()).into();
    assert_eq!(type_str, "REQUEST");

    if let Payload::Method(method) = msg.payload() {
        assert_eq!(method.params()[0].as_str().unwrap(), "Hello");
    } else {
        panic!("Transport message failed to parse as Method");
    }
}

#[test]
fn transport_message_xml_round_trip() {
    let json_value = json::parse(TRANSPORT_MSG_JSON).unwrap();
    let tm = TransportMessage::from_json_value(&json_value).unwrap();

    let xml = tm.to_xml();
    let back = TransportMessage::from_xml(&xml).unwrap();

    assert_eq!(back.thread(), "my-thread");
    assert_eq!(back.to(), "my-to");
    assert_eq!(back.from(), "my-from");

    let msg = &back.body()[0];
    assert_eq!(*msg.mtype(), MessageType::Request);

    match msg.payload() {
        Payload::Method(method) => {
            assert_eq!(method.method(), "opensrf.system.echo");
            assert_eq!(method.params()[0].as_str().unwrap(), "Hello");
            assert_eq!(method.params()[1].as_str().unwrap(), "World");
        }
        _ => panic!("Transport message failed to parse as Method"),
    }
}
