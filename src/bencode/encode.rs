use super::value::Value;

/// Encodes a value to its canonical bencode form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(estimated_len(value));
    encode_into(value, &mut out);
    out
}

/// Encodes a value, appending to an existing buffer.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            // BTreeMap iterates in key order, which is the canonical order.
            out.push(b'd');
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

fn estimated_len(value: &Value) -> usize {
    match value {
        Value::Int(_) => 16,
        Value::Bytes(b) => b.len() + 8,
        Value::List(items) => 2 + items.iter().map(estimated_len).sum::<usize>(),
        Value::Dict(dict) => {
            2 + dict
                .iter()
                .map(|(k, v)| k.len() + 8 + estimated_len(v))
                .sum::<usize>()
        }
    }
}
