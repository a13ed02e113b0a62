//! End-to-end scenario 2 (§8): a message carrying one of every field
//! type survives flatten/unflatten with values intact.

use muscle_reactor::Message;

#[test]
fn every_field_type_round_trips_through_flatten_and_unflatten() {
    let mut msg = Message::new(0xCAFE_BABE);
    msg.add_bool_values("flags", &[true, false, true]).unwrap();
    msg.add_int8("i8", -5).unwrap();
    msg.add_int16("i16", -12_000).unwrap();
    msg.add_int32("i32", -2_000_000_000).unwrap();
    msg.add_int64("i64", -9_000_000_000_000).unwrap();
    msg.add_float("f32", 3.5).unwrap();
    msg.add_double("f64", 2.718281828).unwrap();
    msg.add_point("pt", muscle_reactor::message::Point { x: 1.0, y: -2.5 })
        .unwrap();
    msg.add_rect(
        "rect",
        muscle_reactor::message::Rect {
            left: 0.0,
            top: 0.0,
            right: 10.0,
            bottom: 20.0,
        },
    )
    .unwrap();
    msg.add_string("name", "muscle").unwrap();
    msg.add_raw("blob", 0x1234_5678, vec![9, 8, 7, 6]).unwrap();

    let mut nested = Message::new(7);
    nested.add_string("inner", "nested payload").unwrap();
    msg.add_message("child", nested.clone()).unwrap();

    let bytes = msg.flatten();
    let back = Message::unflatten(&bytes).unwrap();

    assert_eq!(back.what(), 0xCAFE_BABE);
    assert_eq!(back.find_bool("flags", 0).unwrap(), true);
    assert_eq!(back.find_bool("flags", 1).unwrap(), false);
    assert_eq!(back.find_int8("i8", 0).unwrap(), -5);
    assert_eq!(back.find_int16("i16", 0).unwrap(), -12_000);
    assert_eq!(back.find_int32("i32", 0).unwrap(), -2_000_000_000);
    assert_eq!(back.find_int64("i64", 0).unwrap(), -9_000_000_000_000);
    assert_eq!(back.find_float("f32", 0).unwrap(), 3.5);
    assert_eq!(back.find_double("f64", 0).unwrap(), 2.718281828);
    let pt = back.find_point("pt", 0).unwrap();
    assert_eq!((pt.x, pt.y), (1.0, -2.5));
    let rect = back.find_rect("rect", 0).unwrap();
    assert_eq!((rect.left, rect.top, rect.right, rect.bottom), (0.0, 0.0, 10.0, 20.0));
    assert_eq!(back.find_string("name", 0).unwrap(), "muscle");
    let (code, blob) = back.find_raw("blob", 0).unwrap();
    assert_eq!(code, 0x1234_5678);
    assert_eq!(blob, &[9, 8, 7, 6]);
    assert_eq!(back.find_message("child", 0).unwrap(), &nested);

    assert_eq!(back, msg);
}
