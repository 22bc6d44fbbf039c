//! Folder tree blob encoding. A whole tree is staged as one blob.

use super::artifact::read_state;
use super::{required, WireError, WireReader, WireResult, WireWriter};
use crate::model::folder::{Folder, FolderTree};
use crate::model::id::{AppId, ArtifactKind};
use crate::model::state::PersistentState;

const TREE_APP: u32 = 1;
const TREE_KIND: u32 = 2;
const TREE_FOLDER: u32 = 3;

const FOLDER_ID: u32 = 1;
const FOLDER_PARENT: u32 = 2;
const FOLDER_NAME: u32 = 3;
const FOLDER_SORT: u32 = 4;
const FOLDER_VERSION: u32 = 5;
const FOLDER_STATE: u32 = 6;

pub fn encode_folder_tree(tree: &FolderTree) -> WireResult<Vec<u8>> {
    let mut w = WireWriter::new();
    w.field(TREE_APP, |w| w.write_u32(tree.app_id()));
    w.field(TREE_KIND, |w| w.write_u8(tree.target_kind().code()));
    for folder in tree.all() {
        w.field(TREE_FOLDER, |w| {
            w.field(FOLDER_ID, |w| w.write_uuid(folder.id));
            if let Some(parent) = folder.parent {
                w.field(FOLDER_PARENT, |w| w.write_uuid(parent));
            }
            w.field(FOLDER_NAME, |w| w.write_str(&folder.name));
            w.field(FOLDER_SORT, |w| w.write_i32(folder.sort_order));
            w.field(FOLDER_VERSION, |w| w.write_u32(folder.version));
            w.field(FOLDER_STATE, |w| w.write_u8(folder.state.code()));
            w.write_end();
        });
    }
    w.write_end();
    w.finish()
}

pub fn decode_folder_tree(bytes: &[u8]) -> WireResult<FolderTree> {
    const CTX: &str = "folder tree";
    let mut r = WireReader::new(bytes);
    let mut app: Option<AppId> = None;
    let mut kind = None;
    let mut folders = Vec::new();
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            TREE_APP => app = Some(r.read_u32()?),
            TREE_KIND => {
                let code = r.read_u8()?;
                kind = Some(ArtifactKind::from_code(code).map_err(|err| WireError::invalid(CTX, err))?);
            }
            TREE_FOLDER => folders.push(read_folder(&mut r)?),
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    r.finish()?;

    let app = required(app, CTX, "app")?;
    let kind = required(kind, CTX, "kind")?;
    let mut tree = FolderTree::new(app, kind);
    for (id, parent, name, sort_order, version, state) in folders {
        tree.insert_loaded(Folder {
            id,
            app_id: app,
            target_kind: kind,
            parent,
            name,
            sort_order,
            version,
            state,
        })
        .map_err(|err| WireError::invalid(CTX, err))?;
    }
    Ok(tree)
}

type FolderFields = (uuid::Uuid, Option<uuid::Uuid>, String, i32, u32, PersistentState);

fn read_folder(r: &mut WireReader<'_>) -> WireResult<FolderFields> {
    const CTX: &str = "folder";
    let mut id = None;
    let mut parent = None;
    let mut name = None;
    let mut sort_order = 0;
    let mut version = 0;
    let mut state = PersistentState::Detached;
    loop {
        match r.read_tag()? {
            super::END_TAG => break,
            FOLDER_ID => id = Some(r.read_uuid()?),
            FOLDER_PARENT => parent = Some(r.read_uuid()?),
            FOLDER_NAME => name = Some(r.read_string()?),
            FOLDER_SORT => sort_order = r.read_i32()?,
            FOLDER_VERSION => version = r.read_u32()?,
            FOLDER_STATE => state = read_state(r, CTX)?,
            other => return Err(WireError::UnknownTag { context: CTX, tag: other }),
        }
    }
    Ok((
        required(id, CTX, "id")?,
        parent,
        required(name, CTX, "name")?,
        sort_order,
        version,
        state,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_tree_blob_keeps_hierarchy_and_states() {
        let mut tree = FolderTree::new(2, ArtifactKind::Service);
        let parent = tree.create(None, "Billing").unwrap();
        let child = tree.create(Some(parent), "Jobs").unwrap();

        let decoded = decode_folder_tree(&encode_folder_tree(&tree).unwrap()).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.get(child).unwrap().parent, Some(parent));
        assert_eq!(decoded.get(child).unwrap().state, PersistentState::Detached);
    }

    #[test]
    fn unknown_folder_tag_fails() {
        let mut w = WireWriter::new();
        w.field(TREE_APP, |w| w.write_u32(1));
        w.write_tag(77);
        assert!(matches!(
            decode_folder_tree(&w.finish().unwrap()),
            Err(WireError::UnknownTag { tag: 77, .. })
        ));
    }
}
