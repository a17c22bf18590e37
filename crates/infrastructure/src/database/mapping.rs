//! SQLite 行映射辅助函数
//!
//! 枚举以字符串存储，JSON 字段以文本存储。

use std::str::FromStr;

use sqlx::{sqlite::SqliteRow, Row};
use taskpool_core::{SchedulerError, SchedulerResult};

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn parse_enum<T>(row: &SqliteRow, field_name: &str) -> SchedulerResult<T>
    where
        T: FromStr<Err = SchedulerError>,
    {
        let raw: String = row.try_get(field_name)?;
        raw.parse()
    }

    pub fn parse_optional_enum<T>(row: &SqliteRow, field_name: &str) -> SchedulerResult<Option<T>>
    where
        T: FromStr<Err = SchedulerError>,
    {
        let raw: Option<String> = row.try_get(field_name)?;
        raw.map(|s| s.parse()).transpose()
    }

    pub fn parse_json(row: &SqliteRow, field_name: &str) -> SchedulerResult<serde_json::Value> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析 {field_name} 失败: {e}")))
    }

    pub fn parse_optional_json(
        row: &SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<Option<serde_json::Value>> {
        let json_str: Option<String> = row.try_get(field_name)?;
        json_str
            .map(|s| {
                serde_json::from_str(&s).map_err(|e| {
                    SchedulerError::Serialization(format!("解析 {field_name} 失败: {e}"))
                })
            })
            .transpose()
    }

    pub fn parse_string_list(row: &SqliteRow, field_name: &str) -> SchedulerResult<Vec<String>> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析 {field_name} 失败: {e}")))
    }
}
