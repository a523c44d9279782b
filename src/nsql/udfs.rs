//! Scala user defined functions emitted ahead of the first call that needs them

/// `map_blob_json_fetch(map<string, blob>, key, field)`
pub const MAP_BLOB_JSON_FETCH: &str = concat!(
    "var map_blob_json_fetch = udf { (fields: Map[String, Array[Byte]], capability: String, field: String) => ",
    "if(fields.contains(capability)) { ",
    "var byteBuffer = java.nio.ByteBuffer.wrap(fields(capability)); ",
    "var charBuffer = java.nio.charset.StandardCharsets.UTF_8.decode(byteBuffer); ",
    "var jsonAsOption = scala.util.parsing.json.JSON.parseFull(charBuffer.toString()); ",
    "if(jsonAsOption != None) { ",
    "var jsonAsMap = jsonAsOption.get.asInstanceOf[Map[String, Any]]; ",
    "if(jsonAsMap.contains(field)) { jsonAsMap(field).toString() } else { \"\" } ",
    "} else { \"\" } ",
    "} else { \"\" } }"
);

/// `json_fetch(string, field)`
pub const JSON_FETCH: &str = concat!(
    "var json_fetch = udf { (stats: String, field: String) => ",
    "var jsonAsOption = scala.util.parsing.json.JSON.parseFull(stats); ",
    "if(jsonAsOption != None) { ",
    "var jsonAsMap = jsonAsOption.get.asInstanceOf[Map[String, Any]]; ",
    "if(jsonAsMap.contains(field)) { jsonAsMap(field).toString() } else { \"\" } ",
    "} else { \"\" } }"
);

/// `subtract_timestamps(t1, t2)` in nanoseconds, 0 when either side is null
pub const SUBTRACT_TIMESTAMPS: &str = concat!(
    "var subtract_timestamps = udf { (operand1: java.sql.Timestamp, operand2: java.sql.Timestamp) => ",
    "if(operand1 == null || operand2 == null) { 0L } else { ",
    "val time1 = operand1.getTime() * 1000000L; ",
    "val time2 = operand2.getTime() * 1000000L; ",
    "time1 - time2 } }"
);
