mod assembly;
mod dofmap;
mod mesh;
mod timing;
