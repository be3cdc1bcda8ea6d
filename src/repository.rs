//! The `Repository` trait implemented identically by local, remote and encrypted
//! repositories, covering the same operation list across backends, so callers (the
//! VFS resolver, a hypothetical CLI layered on top) can be written against one
//! surface regardless of backend.

use crate::error::Result;
use crate::hash::Oid;
use crate::object::{Commit, ObjectKind, TreeEntry};
use crate::repo_local::CatResult;

pub trait Repository {
    fn config_get(&self, name: &str) -> Result<Option<String>>;
    fn config_write(&mut self, name: &str, value: Option<&str>) -> Result<()>;
    fn config_list(&self) -> Vec<(String, String)>;

    fn read_ref(&self, name: &str) -> Result<Option<Oid>>;
    fn update_ref(&self, name: &str, new: Oid, old: Option<Oid>) -> Result<()>;
    fn delete_ref(&self, name: &str, old: Option<Oid>) -> Result<()>;
    fn refs(&self, patterns: Option<&[String]>, heads: bool, tags: bool) -> Result<Vec<(String, Oid)>>;

    fn exists(&self, oid: &Oid) -> bool;
    fn cat(&mut self, ref_or_oid: &str) -> Result<CatResult>;
    fn get(&mut self, ref_or_oid: &str, include_data: bool) -> Result<(Oid, ObjectKind, u64, Option<Vec<u8>>)>;
    fn walk_object(&mut self, oidx: &str, include_data: bool) -> Result<Vec<CatResult>>;

    fn write_data(&mut self, bytes: &[u8]) -> Result<Oid>;
    fn write_symlink(&mut self, target: &[u8]) -> Result<Oid>;
    fn write_tree_entries(&mut self, entries: &[TreeEntry]) -> Result<Oid>;
    fn write_commit(&mut self, commit: &Commit) -> Result<Oid>;

    fn finish_writing(&mut self, run_midx: bool) -> Result<Option<String>>;
    fn abort_writing(&mut self) -> Result<()>;

    fn is_dumb_server(&self) -> bool;
}

impl Repository for crate::repo_local::LocalRepository {
    fn config_get(&self, name: &str) -> Result<Option<String>> {
        crate::repo_local::LocalRepository::config_get(self, name)
    }

    fn config_write(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        crate::repo_local::LocalRepository::config_write(self, name, value)
    }

    fn config_list(&self) -> Vec<(String, String)> {
        crate::repo_local::LocalRepository::config_list(self)
    }

    fn read_ref(&self, name: &str) -> Result<Option<Oid>> {
        crate::repo_local::LocalRepository::read_ref(self, name)
    }

    fn update_ref(&self, name: &str, new: Oid, old: Option<Oid>) -> Result<()> {
        crate::repo_local::LocalRepository::update_ref(self, name, new, old)
    }

    fn delete_ref(&self, name: &str, old: Option<Oid>) -> Result<()> {
        crate::repo_local::LocalRepository::delete_ref(self, name, old)
    }

    fn refs(&self, patterns: Option<&[String]>, heads: bool, tags: bool) -> Result<Vec<(String, Oid)>> {
        crate::repo_local::LocalRepository::refs(self, patterns, heads, tags)
    }

    fn exists(&self, oid: &Oid) -> bool {
        crate::repo_local::LocalRepository::exists(self, oid)
    }

    fn cat(&mut self, ref_or_oid: &str) -> Result<CatResult> {
        crate::repo_local::LocalRepository::cat(self, ref_or_oid)
    }

    fn get(&mut self, ref_or_oid: &str, include_data: bool) -> Result<(Oid, ObjectKind, u64, Option<Vec<u8>>)> {
        crate::repo_local::LocalRepository::get(self, ref_or_oid, include_data)
    }

    fn walk_object(&mut self, oidx: &str, include_data: bool) -> Result<Vec<CatResult>> {
        crate::repo_local::LocalRepository::walk_object(self, oidx, include_data)
    }

    fn write_data(&mut self, bytes: &[u8]) -> Result<Oid> {
        crate::repo_local::LocalRepository::write_data(self, bytes)
    }

    fn write_symlink(&mut self, target: &[u8]) -> Result<Oid> {
        crate::repo_local::LocalRepository::write_symlink(self, target)
    }

    fn write_tree_entries(&mut self, entries: &[TreeEntry]) -> Result<Oid> {
        crate::repo_local::LocalRepository::write_tree_entries(self, entries)
    }

    fn write_commit(&mut self, commit: &Commit) -> Result<Oid> {
        crate::repo_local::LocalRepository::write_commit(self, commit)
    }

    fn finish_writing(&mut self, run_midx: bool) -> Result<Option<String>> {
        crate::repo_local::LocalRepository::finish_writing(self, run_midx)
    }

    fn abort_writing(&mut self) -> Result<()> {
        crate::repo_local::LocalRepository::abort_writing(self)
    }

    fn is_dumb_server(&self) -> bool {
        crate::repo_local::LocalRepository::is_dumb_server(self)
    }
}
