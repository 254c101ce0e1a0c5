use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{Comment, PlaybackLogEntry, PlayqDatabase, Request, RequestStatus, VideoMetadata};

/// キュー表示順のORDER BY句
///
/// PLAYINGが先頭、次にアクティブな行を(queue_position NULLS LAST, created_at)順、
/// 非アクティブな行は最後。
const QUEUE_ORDER: &str = "ORDER BY
    CASE WHEN status = 'playing' THEN 0
         WHEN status IN ('queued', 'validating', 'downloading', 'ready') THEN 1
         ELSE 2 END,
    CASE WHEN queue_position IS NULL THEN 1 ELSE 0 END,
    queue_position ASC,
    created_at ASC";

impl PlayqDatabase {
    // ---- コメント ----

    /// コメントを保存（id重複時は何もしない、冪等）
    ///
    /// 実際に挿入されたかどうかを返す。
    pub fn insert_comment(&mut self, comment: &Comment) -> Result<bool> {
        let changed = self.connection.execute(
            "INSERT OR IGNORE INTO comments
             (id, platform, room_id, user_id, user_name, message, published_at,
              request_id, request_status, request_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                comment.id,
                comment.platform,
                comment.room_id,
                comment.user_id,
                comment.user_name,
                comment.message,
                comment.published_at.to_rfc3339(),
                comment.request_id,
                comment.request_status,
                comment.request_reason,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_comment(&self, id: &str) -> Result<Option<Comment>> {
        let mut stmt = self
            .connection
            .prepare("SELECT * FROM comments WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], Self::row_to_comment)?;
        Ok(rows.next().transpose()?)
    }

    /// コメントにリクエストの最終状態を反映
    ///
    /// リクエスト行が削除されても、痕跡はここに残る。
    pub fn mirror_request_state_to_comment(
        &mut self,
        request_id: &str,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE comments SET request_status = ?1, request_reason = ?2 WHERE request_id = ?3",
            params![status.as_str(), reason, request_id],
        )?;
        Ok(())
    }

    /// リクエスト行を作らなかった拒否の痕跡をコメントに記録
    pub fn mark_comment_rejected(&mut self, comment_id: &str, reason: &str) -> Result<()> {
        self.connection.execute(
            "UPDATE comments SET request_status = 'rejected', request_reason = ?1 WHERE id = ?2",
            params![reason, comment_id],
        )?;
        Ok(())
    }

    /// コメントとリクエストを紐付け
    pub fn link_comment_to_request(
        &mut self,
        comment_id: &str,
        request_id: &str,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE comments SET request_id = ?1, request_status = ?2, request_reason = ?3
             WHERE id = ?4",
            params![request_id, status.as_str(), reason, comment_id],
        )?;
        Ok(())
    }

    // ---- リクエスト ----

    pub fn insert_request(&mut self, request: &Request) -> Result<()> {
        self.connection.execute(
            "INSERT INTO requests
             (id, bucket, created_at, updated_at, owner_id, owner_name, message,
              raw_url, url, site, video_id, title, duration_sec, uploader,
              view_count, like_count, comment_count, thumbnail_url,
              file_name, cache_path, status, reason, queue_position,
              play_started_at, play_ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            params![
                request.id,
                request.bucket,
                request.created_at.to_rfc3339(),
                request.updated_at.to_rfc3339(),
                request.owner_id,
                request.owner_name,
                request.message,
                request.raw_url,
                request.url,
                request.site,
                request.video_id,
                request.title,
                request.duration_sec,
                request.uploader,
                request.view_count,
                request.like_count,
                request.comment_count,
                request.thumbnail_url,
                request.file_name,
                request.cache_path,
                request.status.as_str(),
                request.reason,
                request.queue_position,
                request.play_started_at.map(|t| t.to_rfc3339()),
                request.play_ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_request(&self, id: &str) -> Result<Option<Request>> {
        let mut stmt = self
            .connection
            .prepare("SELECT * FROM requests WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], Self::row_to_request)?;
        Ok(rows.next().transpose()?)
    }

    /// ステータスと理由を更新（updated_atも更新）
    pub fn update_request_status(
        &mut self,
        id: &str,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE requests SET status = ?1, reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), reason, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn delete_request(&mut self, id: &str) -> Result<()> {
        self.connection
            .execute("DELETE FROM requests WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// バケット内の全リクエストをキュー表示順で取得
    pub fn list_bucket(&self, bucket: &str) -> Result<Vec<Request>> {
        let sql = format!("SELECT * FROM requests WHERE bucket = ?1 {}", QUEUE_ORDER);
        let mut stmt = self.connection.prepare(&sql)?;
        let rows = stmt.query_map(params![bucket], Self::row_to_request)?;
        collect_rows(rows)
    }

    /// バケット内の特定ステータスの行をキュー順で取得
    pub fn list_by_status(&self, bucket: &str, status: RequestStatus) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT * FROM requests WHERE bucket = ?1 AND status = ?2 {}",
            QUEUE_ORDER
        );
        let mut stmt = self.connection.prepare(&sql)?;
        let rows = stmt.query_map(params![bucket, status.as_str()], Self::row_to_request)?;
        collect_rows(rows)
    }

    /// バケット名一覧を取得（"queue"が存在すれば先頭）
    pub fn list_buckets(&self) -> Result<Vec<String>> {
        let mut stmt = self.connection.prepare(
            "SELECT DISTINCT bucket FROM requests
             ORDER BY CASE WHEN bucket = 'queue' THEN 0 ELSE 1 END, bucket",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut buckets = Vec::new();
        for bucket in rows {
            buckets.push(bucket?);
        }
        Ok(buckets)
    }

    pub fn count_status_in_bucket(&self, bucket: &str, status: RequestStatus) -> Result<i64> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM requests WHERE bucket = ?1 AND status = ?2",
            params![bucket, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 全バケット横断のステータス件数（ワーカーのスロット計算用）
    pub fn count_status(&self, status: RequestStatus) -> Result<i64> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM requests WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 同一動画識別子のアクティブな行が"queue"バケットに存在するか
    pub fn has_active_identity(&self, site: &str, video_id: &str) -> Result<bool> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM requests
             WHERE bucket = 'queue' AND site = ?1 AND video_id = ?2
               AND status IN ('queued', 'validating', 'downloading', 'ready', 'playing')",
            params![site, video_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 同一ユーザーのアクティブなリクエスト数（"queue"バケット）
    pub fn count_owner_active(&self, owner_id: &str) -> Result<i64> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM requests
             WHERE bucket = 'queue' AND owner_id = ?1
               AND status IN ('queued', 'validating', 'downloading', 'ready', 'playing')",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn max_queue_position(&self, bucket: &str) -> Result<Option<i64>> {
        let max: Option<i64> = self.connection.query_row(
            "SELECT MAX(queue_position) FROM requests WHERE bucket = ?1",
            params![bucket],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    pub fn set_queue_position(&mut self, id: &str, position: Option<i64>) -> Result<()> {
        self.connection.execute(
            "UPDATE requests SET queue_position = ?1, updated_at = ?2 WHERE id = ?3",
            params![position, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// created_atを現在時刻で更新（SUSPEND復帰時にキュー末尾へ回すため）
    pub fn refresh_created_at(&mut self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.connection.execute(
            "UPDATE requests SET created_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// メタデータ取得結果を反映
    pub fn update_request_metadata(&mut self, id: &str, meta: &VideoMetadata) -> Result<()> {
        self.connection.execute(
            "UPDATE requests SET title = ?1, duration_sec = ?2, uploader = ?3,
                 view_count = ?4, like_count = ?5, comment_count = ?6,
                 thumbnail_url = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                meta.title,
                meta.duration_sec,
                meta.uploader,
                meta.view_count,
                meta.like_count,
                meta.comment_count,
                meta.thumbnail_url,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(())
    }

    /// ダウンロード完了後のキャッシュ情報を保存
    pub fn set_request_cache(
        &mut self,
        id: &str,
        file_name: &str,
        cache_path: &str,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE requests SET file_name = ?1, cache_path = ?2, updated_at = ?3 WHERE id = ?4",
            params![file_name, cache_path, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_play_started(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.connection.execute(
            "UPDATE requests SET play_started_at = ?1, play_ended_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![at.to_rfc3339(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_play_ended(&mut self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.connection.execute(
            "UPDATE requests SET play_ended_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![at.to_rfc3339(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// バケット内のPLAYING行を取得
    pub fn get_playing(&self, bucket: &str) -> Result<Option<Request>> {
        let mut stmt = self
            .connection
            .prepare("SELECT * FROM requests WHERE bucket = ?1 AND status = 'playing'")?;
        let mut rows = stmt.query_map(params![bucket], Self::row_to_request)?;
        Ok(rows.next().transpose()?)
    }

    /// バケット内のPLAYING行をREADYへ降格
    ///
    /// 新しい再生を開始する前と起動時リカバリの両方で使用する。
    /// 「PLAYINGは常に1行以下」の不変条件はこれで維持される。
    pub fn demote_playing(&mut self, bucket: &str) -> Result<usize> {
        let changed = self.connection.execute(
            "UPDATE requests SET status = 'ready', updated_at = ?1
             WHERE bucket = ?2 AND status = 'playing'",
            params![Utc::now().to_rfc3339(), bucket],
        )?;
        Ok(changed)
    }

    /// 中断されたVALIDATING/DOWNLOADING行をQUEUEDへ戻す（全バケット）
    ///
    /// ダウンロードはプロセス再起動をまたいで継続できないため、
    /// 起動時リカバリで呼ぶ。戻さないとスロット計算が残骸を数え続ける。
    pub fn reset_in_flight_downloads(&mut self) -> Result<usize> {
        let changed = self.connection.execute(
            "UPDATE requests SET status = 'queued', updated_at = ?1
             WHERE status IN ('validating', 'downloading')",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(changed)
    }

    // ---- 再生ログ ----

    pub fn append_playback_log(&mut self, entry: &PlaybackLogEntry) -> Result<i64> {
        let id = self
            .connection
            .prepare(
                "INSERT INTO playback_log (request_id, title, url, played_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .insert(params![
                entry.request_id,
                entry.title,
                entry.url,
                entry.played_at.to_rfc3339(),
            ])?;
        Ok(id)
    }

    /// 同一URLの最終再生時刻を取得（クールダウン判定用）
    pub fn last_played_at(&self, url: &str) -> Result<Option<DateTime<Utc>>> {
        let mut stmt = self.connection.prepare(
            "SELECT played_at FROM playback_log WHERE url = ?1
             ORDER BY played_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![url], |row| row.get::<_, String>(0))?;
        match rows.next().transpose()? {
            Some(s) => Ok(Some(parse_rfc3339(&s)?)),
            None => Ok(None),
        }
    }

    pub fn get_playback_log(&self, limit: usize) -> Result<Vec<PlaybackLogEntry>> {
        let mut stmt = self.connection.prepare(
            "SELECT id, request_id, title, url, played_at FROM playback_log
             ORDER BY played_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>("id")?,
                row.get::<_, String>("request_id")?,
                row.get::<_, String>("title")?,
                row.get::<_, String>("url")?,
                row.get::<_, String>("played_at")?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, request_id, title, url, played_at) = row?;
            entries.push(PlaybackLogEntry {
                id: Some(id),
                request_id,
                title,
                url,
                played_at: parse_rfc3339(&played_at)?,
            });
        }
        Ok(entries)
    }

    /// 同一URLの累計再生回数
    pub fn count_plays(&self, url: &str) -> Result<i64> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM playback_log WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 再生ログを全消去（管理者操作）
    pub fn clear_playback_log(&mut self) -> Result<()> {
        self.connection.execute("DELETE FROM playback_log", [])?;
        Ok(())
    }

    // ---- 行変換 ----

    fn row_to_comment(row: &Row) -> rusqlite::Result<Comment> {
        Ok(Comment {
            id: row.get("id")?,
            platform: row.get("platform")?,
            room_id: row.get("room_id")?,
            user_id: row.get("user_id")?,
            user_name: row.get("user_name")?,
            message: row.get("message")?,
            published_at: parse_rfc3339_column(row, "published_at")?,
            request_id: row.get("request_id")?,
            request_status: row.get("request_status")?,
            request_reason: row.get("request_reason")?,
        })
    }

    fn row_to_request(row: &Row) -> rusqlite::Result<Request> {
        let status_str: String = row.get("status")?;
        let status = RequestStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, "status".to_string(), rusqlite::types::Type::Text)
        })?;

        Ok(Request {
            id: row.get("id")?,
            bucket: row.get("bucket")?,
            created_at: parse_rfc3339_column(row, "created_at")?,
            updated_at: parse_rfc3339_column(row, "updated_at")?,
            owner_id: row.get("owner_id")?,
            owner_name: row.get("owner_name")?,
            message: row.get("message")?,
            raw_url: row.get("raw_url")?,
            url: row.get("url")?,
            site: row.get("site")?,
            video_id: row.get("video_id")?,
            title: row.get("title")?,
            duration_sec: row.get("duration_sec")?,
            uploader: row.get("uploader")?,
            view_count: row.get("view_count")?,
            like_count: row.get("like_count")?,
            comment_count: row.get("comment_count")?,
            thumbnail_url: row.get("thumbnail_url")?,
            file_name: row.get("file_name")?,
            cache_path: row.get("cache_path")?,
            status,
            reason: row.get("reason")?,
            queue_position: row.get("queue_position")?,
            play_started_at: row
                .get::<_, Option<String>>("play_started_at")?
                .and_then(|s| parse_optional_timestamp("play_started_at", &s)),
            play_ended_at: row
                .get::<_, Option<String>>("play_ended_at")?
                .and_then(|s| parse_optional_timestamp("play_ended_at", &s)),
        })
    }
}

fn collect_rows<'a>(
    rows: impl Iterator<Item = rusqlite::Result<Request>> + 'a,
) -> Result<Vec<Request>> {
    let mut requests = Vec::new();
    for request in rows {
        requests.push(request?);
    }
    Ok(requests)
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// 省略可能なタイムスタンプ列の読み取り。壊れた値はNone扱いにして警告を残す。
fn parse_optional_timestamp(column: &str, value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(column = column, value = value, "⚠️ Invalid timestamp in row: {}", e);
            None
        }
    }
}

fn parse_rfc3339_column(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, column.to_string(), rusqlite::types::Type::Text)
        })
}
